use std::io::Error;

use bgp_rs::{Capabilities, Message, Reader};
use byteorder::{NetworkEndian, ReadBytesExt};
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};
use twoway::find_bytes;

pub(crate) type MessageProtocol = Framed<TcpStream, MessageCodec>;

const PREAMBLE: [u8; 16] = [0xff; 16];

/// Frames bgp_rs Messages over a TCP stream
#[derive(Debug, Default)]
pub(crate) struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Error> {
        match frame_bounds(buf) {
            Some((start, stop)) if buf.len() >= stop => {
                let mut reader = Reader::<_, Capabilities>::new(&buf[start..stop]);
                let (_header, message) = reader.read()?;
                buf.advance(stop);
                Ok(Some(message))
            }
            _ => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), Error> {
        message.encode(&mut buf.writer())
    }
}

/// Locate one BGP message (preamble + declared length) in the buffer
fn frame_bounds(data: &[u8]) -> Option<(usize, usize)> {
    let start = find_bytes(data, &PREAMBLE)?;
    let mut rest = &data[start + PREAMBLE.len()..];
    let length = rest.read_u16::<NetworkEndian>().ok()?;
    Some((start, start + usize::from(length)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bounds() {
        let mut data = vec![0xffu8; 16];
        data.extend_from_slice(&45u16.to_be_bytes());
        data.extend_from_slice(&[0u8; 46]);
        assert_eq!(frame_bounds(&data), Some((0, 45)));
    }

    #[test]
    fn test_frame_bounds_offset() {
        let mut data = vec![0u8, 1, 2];
        data.extend_from_slice(&[0xffu8; 16]);
        data.extend_from_slice(&19u16.to_be_bytes());
        data.push(4); // keepalive type byte
        assert_eq!(frame_bounds(&data), Some((3, 22)));
    }

    #[test]
    fn test_frame_bounds_no_preamble() {
        let data = [0u8; 32];
        assert_eq!(frame_bounds(&data), None);
    }

    #[test]
    fn test_frame_bounds_incomplete_length() {
        // Preamble present but length bytes missing
        let data = [0xffu8; 17];
        assert_eq!(frame_bounds(&data), None);
    }
}
