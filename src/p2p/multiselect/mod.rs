//! In-stream protocol negotiation ("multistream-select").
//!
//! Both sides first exchange the `/multistream/1.0.0` handshake line,
//! then the initiator proposes protocol identifiers one at a time and
//! the responder echoes the first one it supports, answering `na` to
//! the rest. Messages are varint length-prefixed ASCII lines with a
//! trailing newline.

use std::time::Duration;

use futures::io::{AsyncRead, AsyncWrite};
use log::trace;
use smallvec::SmallVec;

use crate::p2p::error::*;
use crate::p2p::framing;
use crate::p2p::scheduler;

/// A protocol identifier of the form `/name/version`.
pub type ProtocolId = String;

pub const MULTISTREAM_ID: &str = "/multistream/1.0.0";

const MSG_NA: &str = "na";
const MSG_LS: &str = "ls";

/// Per-exchange timeout.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

async fn send_line<C>(io: &mut C, line: &str) -> Result<()>
where
    C: AsyncWrite + Unpin,
{
    // protocol ids are short, keep the message on the stack
    let mut msg: SmallVec<[u8; 64]> = SmallVec::with_capacity(line.len() + 1);
    msg.extend_from_slice(line.as_bytes());
    msg.push(b'\n');
    framing::write_frame(io, &msg).await
}

async fn recv_line<C>(io: &mut C) -> Result<String>
where
    C: AsyncRead + Unpin,
{
    let frame = scheduler::timeout(
        NEGOTIATION_TIMEOUT,
        framing::read_frame(io, framing::MAX_CONTROL_FRAME),
    )
    .await??;
    if frame.last() != Some(&b'\n') {
        return Err(Error::wrapped(
            ErrorKind::ProtocolError,
            "selector message misses newline terminator",
        ));
    }
    String::from_utf8(frame[..frame.len() - 1].to_vec())
        .simple_msg(ErrorKind::ProtocolError, "selector message is not utf-8")
}

/// Negotiates as the initiator, proposing `protocols` in order.
///
/// Returns the protocol the responder accepted, or
/// `NegotiationFailed` once the list is exhausted.
pub async fn select_outbound<C>(io: &mut C, protocols: &[ProtocolId]) -> Result<ProtocolId>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    send_line(io, MULTISTREAM_ID).await?;
    let handshake = recv_line(io).await?;
    if handshake != MULTISTREAM_ID {
        return Err(Error::wrapped(
            ErrorKind::ProtocolError,
            format!("unexpected selector handshake {:?}", handshake),
        ));
    }
    for proposal in protocols {
        send_line(io, proposal).await?;
        let reply = recv_line(io).await?;
        if reply == *proposal {
            trace!("selector settled on {}", proposal);
            return Ok(proposal.clone());
        }
        if reply != MSG_NA {
            return Err(Error::wrapped(
                ErrorKind::ProtocolError,
                format!("unexpected selector reply {:?}", reply),
            ));
        }
    }
    Err(Error::simple(ErrorKind::NegotiationFailed))
}

/// Negotiates as the responder against the currently `supported`
/// protocols.
///
/// In strict mode the `/multistream/1.0.0` handshake must arrive
/// before the first proposal; otherwise a proposal may come first.
pub async fn select_inbound<C>(
    io: &mut C,
    supported: &[ProtocolId],
    strict: bool,
) -> Result<ProtocolId>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    send_line(io, MULTISTREAM_ID).await?;
    let mut first = recv_line(io).await?;
    if first == MULTISTREAM_ID {
        first = recv_line(io).await?;
    } else if strict {
        return Err(Error::wrapped(
            ErrorKind::ProtocolError,
            "proposal arrived before the selector handshake",
        ));
    }
    let mut proposal = first;
    loop {
        if proposal == MSG_LS {
            let mut listing = String::new();
            for proto in supported {
                listing.push_str(proto);
                listing.push('\n');
            }
            // trailing newline is appended by send_line
            listing.pop();
            send_line(io, &listing).await?;
        } else if supported.iter().any(|p| *p == proposal) {
            send_line(io, &proposal).await?;
            trace!("selector settled on {}", proposal);
            return Ok(proposal);
        } else {
            send_line(io, MSG_NA).await?;
        }
        proposal = recv_line(io).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::async_runtime as rt;
    use crate::p2p::transport::TcpTransport;

    async fn tcp_pair() -> (
        crate::p2p::transport::RawConnection,
        crate::p2p::transport::RawConnection,
    ) {
        let transport = TcpTransport::default();
        let listener = transport
            .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().clone();
        let accept = rt::spawn(async move { listener.accept().await.unwrap() });
        let dialer = transport.dial(&addr).await.unwrap();
        (dialer, accept.await.unwrap())
    }

    #[test]
    fn test_first_proposal_accepted() {
        let runtime = rt::build(2).unwrap();
        runtime.block_on(async {
            let (mut a, mut b) = tcp_pair().await;
            let server = rt::spawn(async move {
                select_inbound(&mut b, &["/echo/1.0.0".to_string()], true)
                    .await
                    .unwrap()
            });
            let chosen = select_outbound(&mut a, &["/echo/1.0.0".to_string()])
                .await
                .unwrap();
            assert_eq!(chosen, "/echo/1.0.0");
            assert_eq!(server.await.unwrap(), "/echo/1.0.0");
        });
    }

    #[test]
    fn test_fallback_after_na() {
        let runtime = rt::build(2).unwrap();
        runtime.block_on(async {
            let (mut a, mut b) = tcp_pair().await;
            let server = rt::spawn(async move {
                select_inbound(&mut b, &["/echo/1.0.0".to_string()], true)
                    .await
                    .unwrap()
            });
            let offered = vec!["/x/9.9.9".to_string(), "/echo/1.0.0".to_string()];
            let chosen = select_outbound(&mut a, &offered).await.unwrap();
            assert_eq!(chosen, "/echo/1.0.0");
            assert_eq!(server.await.unwrap(), "/echo/1.0.0");
        });
    }

    #[test]
    fn test_negotiation_failed_when_exhausted() {
        let runtime = rt::build(2).unwrap();
        runtime.block_on(async {
            let (mut a, mut b) = tcp_pair().await;
            rt::spawn(async move {
                // responder keeps answering na until the dialer gives up
                let _ = select_inbound(&mut b, &["/echo/1.0.0".to_string()], true).await;
            });
            let offered = vec!["/x/1.0.0".to_string(), "/y/1.0.0".to_string()];
            let err = select_outbound(&mut a, &offered).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NegotiationFailed);
        });
    }
}
