use crate::error::Error;
use bytes::{Buf, BytesMut};
use rand::{thread_rng, Rng};

/// Websocket close codes used across the crate.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED: u16 = 1003;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_DATA: u16 = 1007;
    pub const POLICY: u16 = 1008;
    pub const TOO_BIG: u16 = 1009;
    pub const MANDATORY_EXTENSION: u16 = 1010;
    pub const INTERNAL: u16 = 1011;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(Error::InvalidOpcode),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    pub fn is_data(&self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub final_fragment: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    /// RSV1 bit, set on the first frame of a message when permessage-deflate
    /// was applied to it.
    pub compressed: bool,
}

impl Frame {
    pub fn new(final_fragment: bool, opcode: OpCode, payload: Vec<u8>, compressed: bool) -> Self {
        Self {
            final_fragment,
            opcode,
            payload,
            compressed,
        }
    }

    /// Close frame payload: 2-byte big-endian code followed by an UTF-8
    /// reason. An empty reason with code 1000 produces just the code.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Frame::new(true, OpCode::Close, payload, false)
    }

    /// Reads the code and reason out of a close frame payload. A missing
    /// payload means the peer closed without a status.
    pub fn parse_close(payload: &[u8]) -> (u16, String) {
        if payload.len() < 2 {
            return (close_code::NO_STATUS, String::new());
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
        (code, reason)
    }
}

/// Which end of the connection this codec runs on. Clients must mask every
/// outgoing frame and reject masked incoming frames; servers do the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Result of one incremental decode step over the inbound buffer.
#[derive(Debug)]
pub enum Decoded {
    /// Not enough buffered bytes for a whole frame yet.
    NeedMore,
    Frame(Frame),
    /// Protocol violation; the carried error maps to the close code the peer
    /// must be told (see [`Error::close_code`]).
    Bad(Error),
}

/// Stateless frame codec. Fragmentation and message reassembly live a layer
/// above, in the read path.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    role: Role,
    deflate_negotiated: bool,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(role: Role, deflate_negotiated: bool, max_frame_size: usize) -> Self {
        Self {
            role,
            deflate_negotiated,
            max_frame_size,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Enables RSV1 acceptance after a successful extension negotiation.
    pub fn set_deflate(&mut self, negotiated: bool) {
        self.deflate_negotiated = negotiated;
    }

    /// Tries to decode one frame from the front of `buf`. Bytes are only
    /// consumed when a complete frame is available; a malformed header
    /// consumes nothing and reports the violation.
    pub fn decode(&self, buf: &mut BytesMut) -> Decoded {
        if buf.len() < 2 {
            return Decoded::NeedMore;
        }

        let final_fragment = (buf[0] & 0b10000000) != 0;
        let rsv1 = (buf[0] & 0b01000000) != 0;
        let rsv2 = (buf[0] & 0b00100000) != 0;
        let rsv3 = (buf[0] & 0b00010000) != 0;

        let opcode = match OpCode::from(buf[0] & 0b00001111) {
            Ok(opcode) => opcode,
            Err(e) => return Decoded::Bad(e),
        };

        // RSV2/RSV3 have no negotiated meaning here, and RSV1 is only valid
        // with permessage-deflate, on the first frame of a data message.
        if rsv2 || rsv3 {
            return Decoded::Bad(Error::RSVNotZero);
        }
        if rsv1 && (!self.deflate_negotiated || opcode.is_control() || opcode == OpCode::Continue) {
            return Decoded::Bad(Error::RSVNotZero);
        }

        if opcode.is_control() && !final_fragment {
            return Decoded::Bad(Error::ControlFramesFragmented);
        }

        let masked = (buf[1] & 0b10000000) != 0;

        // A server must receive masked frames, a client unmasked ones.
        match self.role {
            Role::Client if masked => return Decoded::Bad(Error::MaskedFrameFromServer),
            Role::Server if !masked => return Decoded::Bad(Error::UnmaskedFrameFromClient),
            _ => {}
        }

        let length_code = (buf[1] & 0b01111111) as usize;
        if opcode.is_control() && length_code > 125 {
            return Decoded::Bad(Error::ControlFramePayloadSize);
        }

        // 7-bit lengths up to 125, then 2 or 8 extra big-endian bytes.
        let (length, extended) = match length_code {
            126 => {
                if buf.len() < 4 {
                    return Decoded::NeedMore;
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as usize, 2)
            }
            127 => {
                if buf.len() < 10 {
                    return Decoded::NeedMore;
                }
                let mut be_bytes = [0u8; 8];
                be_bytes.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(be_bytes) as usize, 8)
            }
            n => (n, 0),
        };

        if length > self.max_frame_size {
            return Decoded::Bad(Error::MaxFrameSize);
        }

        let mask_len = if masked { 4 } else { 0 };
        let frame_len = 2 + extended + mask_len + length;
        if buf.len() < frame_len {
            return Decoded::NeedMore;
        }

        let mask = if masked {
            let at = 2 + extended;
            Some([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
        } else {
            None
        };

        buf.advance(2 + extended + mask_len);
        let mut payload = buf.split_to(length).to_vec();

        // XOR each payload byte with the mask, modulo 4.
        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }

        Decoded::Frame(Frame {
            final_fragment,
            opcode,
            payload,
            compressed: rsv1,
        })
    }

    /// Emits a frame with the masking rule of this codec's role.
    pub fn encode(&self, frame: &Frame) -> Vec<u8> {
        let mask = match self.role {
            Role::Client => {
                let mut rng = thread_rng();
                Some([rng.gen(), rng.gen(), rng.gen(), rng.gen()])
            }
            Role::Server => None,
        };
        self.encode_with_mask(frame, mask)
    }

    pub(crate) fn encode_with_mask(&self, frame: &Frame, mask: Option<[u8; 4]>) -> Vec<u8> {
        let payload_len = frame.payload.len();
        let mut out = Vec::with_capacity(2 + 8 + 4 + payload_len);

        // First byte: FIN << 7 | RSV1 << 6 | RSV2 << 5 | RSV3 << 4 | opcode.
        let mut first_byte = (frame.final_fragment as u8) << 7 | frame.opcode.as_u8();
        if frame.compressed {
            first_byte |= 0b01000000;
        }
        out.push(first_byte);

        let mask_bit = if mask.is_some() { 0b1000_0000 } else { 0 };
        if payload_len <= 125 {
            out.push(mask_bit | payload_len as u8);
        } else if payload_len <= 65535 {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(payload_len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(payload_len as u64).to_be_bytes());
        }

        match mask {
            Some(mask) => {
                out.extend_from_slice(&mask);
                out.extend(
                    frame
                        .payload
                        .iter()
                        .enumerate()
                        .map(|(i, &byte)| byte ^ mask[i % 4]),
                );
            }
            None => out.extend_from_slice(&frame.payload),
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_codec() -> FrameCodec {
        FrameCodec::new(Role::Client, false, 16 << 20)
    }

    fn server_codec() -> FrameCodec {
        FrameCodec::new(Role::Server, false, 16 << 20)
    }

    #[test]
    fn test_opcode() {
        assert_eq!(OpCode::from(0x0).unwrap(), OpCode::Continue);
        assert_eq!(OpCode::Text.as_u8(), 0x1);
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(OpCode::from(0x3).is_err());
    }

    #[test]
    fn test_text_frame_wire_format() {
        // "hello" from a client: 81 85 <mask> <masked payload>
        let frame = Frame::new(true, OpCode::Text, b"hello".to_vec(), false);
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let bytes = client_codec().encode_with_mask(&frame, Some(mask));
        assert_eq!(bytes[0], 0x81);
        assert_eq!(bytes[1], 0x85);
        assert_eq!(&bytes[2..6], &mask);
        assert_eq!(bytes.len(), 2 + 4 + 5);

        let mut buf = BytesMut::from(&bytes[..]);
        match server_codec().decode(&mut buf) {
            Decoded::Frame(decoded) => {
                assert!(decoded.final_fragment);
                assert_eq!(decoded.opcode, OpCode::Text);
                assert_eq!(decoded.payload, b"hello");
            }
            other => panic!("expected frame, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_length_encoding_boundaries() {
        for (len, header) in [
            (125usize, 2usize),
            (126, 4),
            (127, 4),
            (65535, 4),
            (65536, 10),
        ] {
            let frame = Frame::new(true, OpCode::Binary, vec![0xAB; len], false);
            let bytes = server_codec().encode_with_mask(&frame, None);
            assert_eq!(bytes.len(), header + len, "payload of {} bytes", len);

            let mut buf = BytesMut::from(&bytes[..]);
            match client_codec().decode(&mut buf) {
                Decoded::Frame(decoded) => assert_eq!(decoded.payload.len(), len),
                other => panic!("expected frame for len {}, got {:?}", len, other),
            }
        }
    }

    #[test]
    fn test_roundtrip_with_same_mask() {
        let mask = [1, 2, 3, 4];
        let frame = Frame::new(true, OpCode::Binary, (0..200u8).collect(), false);
        let bytes = client_codec().encode_with_mask(&frame, Some(mask));

        let mut buf = BytesMut::from(&bytes[..]);
        let decoded = match server_codec().decode(&mut buf) {
            Decoded::Frame(frame) => frame,
            other => panic!("expected frame, got {:?}", other),
        };
        let reencoded = client_codec().encode_with_mask(&decoded, Some(mask));
        assert_eq!(reencoded, bytes);
    }

    #[test]
    fn test_need_more_on_partial_frame() {
        let frame = Frame::new(true, OpCode::Binary, vec![0; 300], false);
        let bytes = server_codec().encode_with_mask(&frame, None);

        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(matches!(client_codec().decode(&mut buf), Decoded::NeedMore));
        buf.extend_from_slice(&bytes[bytes.len() - 1..]);
        assert!(matches!(client_codec().decode(&mut buf), Decoded::Frame(_)));
    }

    #[test]
    fn test_masked_frame_from_server_rejected() {
        let frame = Frame::new(true, OpCode::Text, b"x".to_vec(), false);
        let bytes = client_codec().encode_with_mask(&frame, Some([9, 9, 9, 9]));
        let mut buf = BytesMut::from(&bytes[..]);
        match client_codec().decode(&mut buf) {
            Decoded::Bad(e) => assert_eq!(e.close_code(), Some(close_code::PROTOCOL_ERROR)),
            other => panic!("expected protocol violation, got {:?}", other),
        }
    }

    #[test]
    fn test_unmasked_frame_from_client_rejected() {
        let frame = Frame::new(true, OpCode::Text, b"x".to_vec(), false);
        let bytes = server_codec().encode_with_mask(&frame, None);
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            server_codec().decode(&mut buf),
            Decoded::Bad(Error::UnmaskedFrameFromClient)
        ));
    }

    #[test]
    fn test_rsv_bits_rejected_without_extension() {
        // RSV2 set
        let mut buf = BytesMut::from(&[0b1010_0001u8, 0x00][..]);
        assert!(matches!(
            client_codec().decode(&mut buf),
            Decoded::Bad(Error::RSVNotZero)
        ));

        // RSV1 without negotiated deflate
        let mut buf = BytesMut::from(&[0b1100_0001u8, 0x00][..]);
        assert!(matches!(
            client_codec().decode(&mut buf),
            Decoded::Bad(Error::RSVNotZero)
        ));

        // RSV1 on a continuation frame even with deflate negotiated
        let deflate = FrameCodec::new(Role::Client, true, 16 << 20);
        let mut buf = BytesMut::from(&[0b1100_0000u8, 0x00][..]);
        assert!(matches!(
            deflate.decode(&mut buf),
            Decoded::Bad(Error::RSVNotZero)
        ));
    }

    #[test]
    fn test_fragmented_control_frame_rejected() {
        let mut buf = BytesMut::from(&[0b0000_1001u8, 0x00][..]);
        assert!(matches!(
            client_codec().decode(&mut buf),
            Decoded::Bad(Error::ControlFramesFragmented)
        ));
    }

    #[test]
    fn test_oversized_control_frame_rejected() {
        let mut buf = BytesMut::from(&[0b1000_1001u8, 126, 0x00, 0xFF][..]);
        assert!(matches!(
            client_codec().decode(&mut buf),
            Decoded::Bad(Error::ControlFramePayloadSize)
        ));
    }

    #[test]
    fn test_reserved_opcode_rejected() {
        let mut buf = BytesMut::from(&[0b1000_0011u8, 0x00][..]);
        assert!(matches!(
            client_codec().decode(&mut buf),
            Decoded::Bad(Error::InvalidOpcode)
        ));
    }

    #[test]
    fn test_close_payload_roundtrip() {
        let frame = Frame::close(close_code::PROTOCOL_ERROR, "Masked frame from server");
        let (code, reason) = Frame::parse_close(&frame.payload);
        assert_eq!(code, close_code::PROTOCOL_ERROR);
        assert_eq!(reason, "Masked frame from server");

        let (code, reason) = Frame::parse_close(&[]);
        assert_eq!(code, close_code::NO_STATUS);
        assert!(reason.is_empty());
    }
}
