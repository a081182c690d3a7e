//! The Kademlia wire message, serialized with protobuf.
//!
//! Field numbers follow the deployed DHT protocol so any compliant
//! codec produces the same bytes: type=1, key=2, record=3,
//! closer_peers=8, provider_peers=9, cluster_level_raw=10.

use multiaddr::Multiaddr;

use crate::p2p::network::Connectedness;
use crate::p2p::peer::{PeerId, PeerInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    PutValue = 0,
    GetValue = 1,
    AddProvider = 2,
    GetProviders = 3,
    FindNode = 4,
    Ping = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConnectionType {
    NotConnected = 0,
    Connected = 1,
    CanConnect = 2,
    CannotConnect = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Record {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
    #[prost(string, tag = "5")]
    pub time_received: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WirePeer {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
    #[prost(enumeration = "ConnectionType", tag = "3")]
    pub connection: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub record: Option<Record>,
    #[prost(message, repeated, tag = "8")]
    pub closer_peers: Vec<WirePeer>,
    #[prost(message, repeated, tag = "9")]
    pub provider_peers: Vec<WirePeer>,
    /// Ignored on receive.
    #[prost(int32, tag = "10")]
    pub cluster_level_raw: i32,
}

impl Message {
    pub fn new(ty: MessageType, key: Vec<u8>) -> Message {
        Message {
            r#type: ty as i32,
            key,
            ..Message::default()
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.r#type).ok()
    }
}

impl WirePeer {
    pub fn from_info(info: &PeerInfo, connectedness: Connectedness) -> WirePeer {
        WirePeer {
            id: info.id.to_bytes(),
            addrs: info.addresses.iter().map(|a| a.to_vec()).collect(),
            connection: match connectedness {
                Connectedness::NotConnected => ConnectionType::NotConnected,
                Connectedness::Connected => ConnectionType::Connected,
                Connectedness::CanConnect => ConnectionType::CanConnect,
                Connectedness::CannotConnect => ConnectionType::CannotConnect,
            } as i32,
        }
    }

    /// Decodes into a `PeerInfo`, dropping unreachable entries:
    /// `CANNOT_CONNECT` and `NOT_CONNECTED` peers are not considered.
    pub fn into_reachable_info(self) -> Option<PeerInfo> {
        match ConnectionType::try_from(self.connection) {
            Ok(ConnectionType::Connected) | Ok(ConnectionType::CanConnect) => {}
            _ => return None,
        }
        self.into_info()
    }

    /// Decodes into a `PeerInfo` regardless of connectedness.
    pub fn into_info(self) -> Option<PeerInfo> {
        let id = PeerId::from_bytes(&self.id).ok()?;
        let addresses = self
            .addrs
            .into_iter()
            .filter_map(|raw| Multiaddr::try_from(raw).ok())
            .collect();
        Some(PeerInfo::with_addresses(id, addresses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn test_message_roundtrip() {
        let mut msg = Message::new(MessageType::FindNode, b"key".to_vec());
        msg.closer_peers.push(WirePeer {
            id: PeerId::random().to_bytes(),
            addrs: vec!["/ip4/127.0.0.1/tcp/4001"
                .parse::<Multiaddr>()
                .unwrap()
                .to_vec()],
            connection: ConnectionType::CanConnect as i32,
        });
        let bytes = msg.encode_to_vec();
        let back = Message::decode(&bytes[..]).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.message_type(), Some(MessageType::FindNode));
    }

    #[test]
    fn test_unreachable_peers_are_dropped() {
        let id = PeerId::random();
        let peer = WirePeer {
            id: id.to_bytes(),
            addrs: Vec::new(),
            connection: ConnectionType::CannotConnect as i32,
        };
        assert!(peer.clone().into_reachable_info().is_none());
        assert!(peer.into_info().is_some());

        let peer = WirePeer {
            id: id.to_bytes(),
            addrs: Vec::new(),
            connection: ConnectionType::CanConnect as i32,
        };
        assert_eq!(peer.into_reachable_info().unwrap().id, id);
    }
}
