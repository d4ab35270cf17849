use crate::error::Error;
use crate::frame::{Frame, OpCode};

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    // Converts a fully reassembled frame into a Message variant
    pub fn from_frame(frame: Frame) -> Result<Self, Error> {
        match frame.opcode {
            OpCode::Text => Ok(Message::Text(String::from_utf8(frame.payload)?)),
            OpCode::Binary => Ok(Message::Binary(frame.payload)),
            _ => Err(Error::InvalidOpcode),
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }

    pub fn as_binary(&self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(data) => data.clone(),
        }
    }

    pub fn as_text(&self) -> Result<String, Error> {
        match self {
            Message::Text(text) => Ok(text.clone()),
            Message::Binary(data) => Ok(String::from_utf8(data.clone())?),
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
        }
    }

    /// Splits the message into wire frames no larger than `segment_size`.
    /// The first frame carries the data opcode and, when the payload was
    /// deflated, the RSV1 marker; the rest are continuations. Only the last
    /// frame has FIN set.
    pub fn to_frames(self, segment_size: usize, compressed: bool) -> Vec<Frame> {
        let opcode = self.opcode();
        let payload = self.into_payload();

        if payload.is_empty() {
            return vec![Frame {
                final_fragment: true,
                opcode,
                payload,
                compressed: false,
            }];
        }

        let mut frames = Vec::new();
        for chunk in payload.chunks(segment_size) {
            frames.push(Frame {
                final_fragment: false,
                opcode: if frames.is_empty() {
                    opcode
                } else {
                    OpCode::Continue
                },
                payload: chunk.to_vec(),
                compressed: compressed && frames.is_empty(),
            });
        }

        if let Some(last_frame) = frames.last_mut() {
            last_frame.final_fragment = true;
        }

        frames
    }
}
