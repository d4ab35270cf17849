use crate::error::Error;
use crate::frame::{Frame, FrameCodec, OpCode, Role};
use crate::stream::BoxStream;
use tokio::io::{AsyncWriteExt, WriteHalf};

/// Owns the write half of a connection and frames everything that leaves.
/// The role decides masking: client frames are masked with a fresh random
/// key each, server frames go out unmasked.
pub struct Writer {
    write_half: WriteHalf<BoxStream>,
    codec: FrameCodec,
    closed: bool,
}

impl Writer {
    pub fn new(write_half: WriteHalf<BoxStream>, role: Role) -> Self {
        Self {
            write_half,
            codec: FrameCodec::new(role, false, usize::MAX),
            closed: false,
        }
    }

    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), Error> {
        if self.closed && frame.opcode != OpCode::Close {
            return Err(Error::CommunicationError);
        }
        let bytes = self.codec.encode(&frame);
        self.write_half.write_all(&bytes).await?;
        self.write_half.flush().await?;
        Ok(())
    }

    /// Sends a close frame carrying `code` and `reason`; later writes are
    /// refused. Safe to call twice.
    pub async fn write_close(&mut self, code: u16, reason: &str) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = Frame::close(code, reason);
        let bytes = self.codec.encode(&frame);
        self.write_half.write_all(&bytes).await?;
        self.write_half.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.closed = true;
        self.write_half.shutdown().await?;
        Ok(())
    }
}
