//! Length-prefixed message framing over a byte stream.
//!
//! Every in-band mini-protocol of the stack (multistream-select, the
//! Noise handshake payloads, Kademlia and Identify messages) frames its
//! messages with an unsigned varint length prefix. The decoder is an
//! explicit state machine so that it can be fed partial input and never
//! consumes a single byte past the announced length.

use bytes::{Bytes, BytesMut};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use unsigned_varint::{decode, encode};

use crate::p2p::error::*;

/// Frame cap for protocol-selector and handshake exchanges.
pub const MAX_CONTROL_FRAME: usize = 65535;

/// Frame cap for application data frames (muxer payloads, kad records).
pub const MAX_DATA_FRAME: usize = 4 * 1024 * 1024;

// a varint length prefix never needs more than 10 bytes
const MAX_PREFIX_LEN: usize = 10;

/// Decoder states, in the order they are normally traversed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DecodeState {
    /// Accumulating varint length bytes.
    ReadingLength,
    /// Accumulating body bytes.
    ReadingBody,
    /// A full frame is buffered and may be taken.
    MessageReady,
    /// The announced length exceeded the configured cap. Fatal.
    Overflow,
    /// The length prefix was malformed. Fatal.
    Error,
}

/// Incremental decoder for varint length-prefixed frames.
pub struct FrameDecoder {
    max_frame: usize,
    state: DecodeState,
    prefix: [u8; MAX_PREFIX_LEN],
    prefix_len: usize,
    body: BytesMut,
    expected: usize,
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            state: DecodeState::ReadingLength,
            prefix: [0; MAX_PREFIX_LEN],
            prefix_len: 0,
            body: BytesMut::new(),
            expected: 0,
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Feeds bytes into the decoder. Returns the number of bytes
    /// consumed from `input`; the remainder belongs to the next frame
    /// or to whatever follows on the stream.
    pub fn feed(&mut self, input: &[u8]) -> Result<usize> {
        let mut consumed = 0;
        while consumed < input.len() {
            match self.state {
                DecodeState::ReadingLength => {
                    let byte = input[consumed];
                    if self.prefix_len == MAX_PREFIX_LEN {
                        self.state = DecodeState::Error;
                        return Err(Error::wrapped(
                            ErrorKind::ProtocolError,
                            "varint length prefix too long",
                        ));
                    }
                    self.prefix[self.prefix_len] = byte;
                    self.prefix_len += 1;
                    consumed += 1;
                    if byte & 0x80 == 0 {
                        let (len, _) = decode::usize(&self.prefix[..self.prefix_len])
                            .wrapped(ErrorKind::ProtocolError)?;
                        if len > self.max_frame {
                            self.state = DecodeState::Overflow;
                            return Err(Error::wrapped(
                                ErrorKind::ProtocolError,
                                format!("frame of {} bytes exceeds cap {}", len, self.max_frame),
                            ));
                        }
                        self.expected = len;
                        self.body.clear();
                        self.body.reserve(len);
                        self.state = if len == 0 {
                            DecodeState::MessageReady
                        } else {
                            DecodeState::ReadingBody
                        };
                        if self.state == DecodeState::MessageReady {
                            return Ok(consumed);
                        }
                    }
                }
                DecodeState::ReadingBody => {
                    let missing = self.expected - self.body.len();
                    let take = missing.min(input.len() - consumed);
                    self.body.extend_from_slice(&input[consumed..consumed + take]);
                    consumed += take;
                    if self.body.len() == self.expected {
                        self.state = DecodeState::MessageReady;
                        return Ok(consumed);
                    }
                }
                DecodeState::MessageReady => return Ok(consumed),
                DecodeState::Overflow | DecodeState::Error => {
                    return Err(Error::simple(ErrorKind::ProtocolError));
                }
            }
        }
        Ok(consumed)
    }

    /// Takes the buffered frame, resetting the decoder for the next one.
    pub fn take(&mut self) -> Option<Bytes> {
        if self.state != DecodeState::MessageReady {
            return None;
        }
        let frame = self.body.split().freeze();
        self.state = DecodeState::ReadingLength;
        self.prefix_len = 0;
        self.expected = 0;
        Some(frame)
    }
}

/// Appends `data` to `out` as one varint length-prefixed frame.
pub fn encode_frame(data: &[u8], out: &mut Vec<u8>) {
    let mut prefix = encode::usize_buffer();
    out.extend_from_slice(encode::usize(data.len(), &mut prefix));
    out.extend_from_slice(data);
}

/// Reads one unsigned varint, byte by byte.
pub async fn read_uvarint<R>(io: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; MAX_PREFIX_LEN];
    let mut n = 0;
    loop {
        let mut byte = [0u8; 1];
        io.read_exact(&mut byte[..]).await?;
        if n == MAX_PREFIX_LEN {
            return Err(Error::wrapped(ErrorKind::ProtocolError, "varint too long"));
        }
        prefix[n] = byte[0];
        n += 1;
        if byte[0] & 0x80 == 0 {
            let (value, _) = decode::u64(&prefix[..n]).wrapped(ErrorKind::ProtocolError)?;
            return Ok(value);
        }
    }
}

/// Reads one length-prefixed frame, rejecting frames above `max_frame`.
pub async fn read_frame<R>(io: &mut R, max_frame: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = read_uvarint(io).await? as usize;
    if len > max_frame {
        return Err(Error::wrapped(
            ErrorKind::ProtocolError,
            format!("frame of {} bytes exceeds cap {}", len, max_frame),
        ));
    }
    let mut body = vec![0u8; len];
    io.read_exact(&mut body[..]).await?;
    Ok(body)
}

/// Writes one length-prefixed frame and flushes.
pub async fn write_frame<W>(io: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(data.len() + MAX_PREFIX_LEN);
    encode_frame(data, &mut buf);
    io.write_all(&buf[..]).await?;
    io.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    fn decode_all(decoder: &mut FrameDecoder, mut input: &[u8]) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while !input.is_empty() {
            let consumed = decoder.feed(input).expect("feed failed");
            input = &input[consumed..];
            if let Some(frame) = decoder.take() {
                frames.push(frame);
            }
        }
        frames
    }

    #[test]
    fn test_roundtrip_random_frames() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let len = rng.gen_range(0..4096);
            let mut payload = vec![0u8; len];
            rng.fill_bytes(&mut payload[..]);

            let mut wire = Vec::new();
            encode_frame(&payload, &mut wire);

            let mut decoder = FrameDecoder::new(MAX_CONTROL_FRAME);
            let frames = decode_all(&mut decoder, &wire);
            assert_eq!(frames.len(), 1);
            assert_eq!(&frames[0][..], &payload[..]);
        }
    }

    #[test]
    fn test_never_consumes_past_frame() {
        let mut wire = Vec::new();
        encode_frame(b"hello", &mut wire);
        // trailing bytes that belong to the next protocol layer
        wire.extend_from_slice(b"TRAILER");

        let mut decoder = FrameDecoder::new(MAX_CONTROL_FRAME);
        let consumed = decoder.feed(&wire).unwrap();
        assert_eq!(consumed, wire.len() - b"TRAILER".len());
        assert_eq!(&decoder.take().unwrap()[..], b"hello");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut wire = Vec::new();
        encode_frame(&[7u8; 300][..], &mut wire);

        let mut decoder = FrameDecoder::new(MAX_CONTROL_FRAME);
        let mut got = None;
        for byte in wire {
            decoder.feed(&[byte]).unwrap();
            if let Some(frame) = decoder.take() {
                got = Some(frame);
            }
        }
        assert_eq!(got.unwrap().len(), 300);
    }

    #[test]
    fn test_overflow_is_fatal() {
        let mut wire = Vec::new();
        encode_frame(&vec![0u8; 1024][..], &mut wire);

        let mut decoder = FrameDecoder::new(16);
        assert!(decoder.feed(&wire).is_err());
        assert_eq!(decoder.state(), DecodeState::Overflow);
        // decoder stays poisoned
        assert!(decoder.feed(&[0]).is_err());
    }

    #[test]
    fn test_empty_frame() {
        let mut wire = Vec::new();
        encode_frame(&[], &mut wire);
        let mut decoder = FrameDecoder::new(16);
        let consumed = decoder.feed(&wire).unwrap();
        assert_eq!(consumed, 1);
        assert_eq!(decoder.take().unwrap().len(), 0);
    }
}
