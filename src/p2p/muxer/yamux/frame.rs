//! The yamux wire frame: a 12 byte header and an optional payload.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::p2p::error::*;
use crate::p2p::framing::MAX_DATA_FRAME;

pub const HEADER_LEN: usize = 12;

pub const VERSION: u8 = 0;

pub mod flags {
    pub const SYN: u16 = 1;
    pub const ACK: u16 = 2;
    pub const FIN: u16 = 4;
    pub const RST: u16 = 8;
}

pub mod go_away {
    pub const NORMAL: u32 = 0;
    pub const PROTOCOL_ERROR: u32 = 1;
    pub const INTERNAL_ERROR: u32 = 2;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameType {
    Data,
    WindowUpdate,
    Ping,
    GoAway,
}

impl FrameType {
    fn from_wire(byte: u8) -> Result<FrameType> {
        match byte {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::WindowUpdate),
            2 => Ok(FrameType::Ping),
            3 => Ok(FrameType::GoAway),
            other => Err(Error::wrapped(
                ErrorKind::ProtocolError,
                format!("unknown yamux frame type {}", other),
            )),
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            FrameType::Data => 0,
            FrameType::WindowUpdate => 1,
            FrameType::Ping => 2,
            FrameType::GoAway => 3,
        }
    }
}

/// One yamux frame. `length` doubles as payload length (DATA), credit
/// delta (WINDOW_UPDATE), opaque value (PING) and error code (GO_AWAY).
#[derive(Debug, Clone)]
pub struct Frame {
    pub ty: FrameType,
    pub flags: u16,
    pub stream_id: u32,
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn data(stream_id: u32, flags: u16, payload: Vec<u8>) -> Frame {
        Frame {
            ty: FrameType::Data,
            flags,
            stream_id,
            length: payload.len() as u32,
            payload,
        }
    }

    pub fn window_update(stream_id: u32, flags: u16, credit: u32) -> Frame {
        Frame {
            ty: FrameType::WindowUpdate,
            flags,
            stream_id,
            length: credit,
            payload: Vec::new(),
        }
    }

    pub fn ping(flags: u16, opaque: u32) -> Frame {
        Frame {
            ty: FrameType::Ping,
            flags,
            stream_id: 0,
            length: opaque,
            payload: Vec::new(),
        }
    }

    pub fn go_away(code: u32) -> Frame {
        Frame {
            ty: FrameType::GoAway,
            flags: 0,
            stream_id: 0,
            length: code,
            payload: Vec::new(),
        }
    }

    pub fn header_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = VERSION;
        buf[1] = self.ty.to_wire();
        buf[2..4].copy_from_slice(&self.flags.to_be_bytes());
        buf[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn parse_header(buf: &[u8; HEADER_LEN]) -> Result<Frame> {
        if buf[0] != VERSION {
            return Err(Error::wrapped(
                ErrorKind::ProtocolError,
                format!("unknown yamux version {}", buf[0]),
            ));
        }
        Ok(Frame {
            ty: FrameType::from_wire(buf[1])?,
            flags: u16::from_be_bytes([buf[2], buf[3]]),
            stream_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            payload: Vec::new(),
        })
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Reads one frame. DATA payloads above the data frame cap are a
/// framing violation and fatal for the connection.
pub async fn read_frame<R>(io: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    io.read_exact(&mut header[..]).await?;
    let mut frame = Frame::parse_header(&header)?;
    if frame.ty == FrameType::Data {
        let len = frame.length as usize;
        if len > MAX_DATA_FRAME {
            return Err(Error::wrapped(
                ErrorKind::ProtocolError,
                format!("yamux data frame of {} bytes exceeds cap", len),
            ));
        }
        let mut payload = vec![0u8; len];
        io.read_exact(&mut payload[..]).await?;
        frame.payload = payload;
    }
    Ok(frame)
}

/// Writes one frame and flushes it out.
pub async fn write_frame<W>(io: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(&frame.header_bytes()[..]).await?;
    if !frame.payload.is_empty() {
        io.write_all(&frame.payload[..]).await?;
    }
    io.flush().await?;
    Ok(())
}
