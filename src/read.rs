use crate::compression::Decoder;
use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::frame::{close_code, Decoded, Frame, FrameCodec, OpCode, Role};
use crate::message::Message;
use crate::stream::BoxStream;
use crate::write::Writer;
use bytes::BytesMut;
use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::mpsc::Sender;
use tokio::sync::Mutex as AsyncMutex;

/// Liveness bookkeeping shared between the read loop (which sees pongs) and
/// the ping loop (which decides when the peer went quiet).
#[derive(Debug)]
pub struct PingTracker {
    last_pong: Mutex<Instant>,
    last_ping_sent: Mutex<Instant>,
}

impl Default for PingTracker {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            last_pong: Mutex::new(now),
            last_ping_sent: Mutex::new(now),
        }
    }
}

impl PingTracker {
    fn lock_instant(slot: &Mutex<Instant>) -> std::sync::MutexGuard<'_, Instant> {
        match slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn touch_pong(&self) {
        *Self::lock_instant(&self.last_pong) = Instant::now();
    }

    pub fn touch_ping_sent(&self) {
        *Self::lock_instant(&self.last_ping_sent) = Instant::now();
    }

    pub fn since_pong(&self) -> std::time::Duration {
        Self::lock_instant(&self.last_pong).elapsed()
    }

    pub fn since_ping_sent(&self) -> std::time::Duration {
        Self::lock_instant(&self.last_ping_sent).elapsed()
    }
}

struct FragmentedMessage {
    fragments: Vec<u8>,
    op_code: OpCode,
    compressed: bool,
}

/// Drives the inbound half of a Websocket connection: buffers socket bytes,
/// decodes frames, reassembles fragmented messages and forwards complete
/// ones through the channel. Control frames are handled in place and never
/// join the reassembly buffer.
pub struct ReadStream {
    read_half: ReadHalf<BoxStream>,
    buffer: BytesMut,
    codec: FrameCodec,
    fragmented_message: Option<FragmentedMessage>,
    pub read_tx: Sender<Result<Message, Error>>,
    writer: Arc<AsyncMutex<Writer>>,
    config: WebSocketConfig,
    decoder: Option<Decoder>,
    ping: Arc<PingTracker>,
    close_received: bool,
}

impl ReadStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        read_half: ReadHalf<BoxStream>,
        role: Role,
        read_tx: Sender<Result<Message, Error>>,
        writer: Arc<AsyncMutex<Writer>>,
        config: WebSocketConfig,
        decoder: Option<Decoder>,
        ping: Arc<PingTracker>,
        leftover: BytesMut,
    ) -> Self {
        let deflate = decoder.is_some();
        let max_frame_size = config.max_frame_size.unwrap_or(usize::MAX);
        Self {
            read_half,
            buffer: leftover,
            codec: FrameCodec::new(role, deflate, max_frame_size),
            fragmented_message: None,
            read_tx,
            writer,
            config,
            decoder,
            ping,
            close_received: false,
        }
    }

    /// Runs until the connection closes or a protocol violation fires. On a
    /// violation the peer is told the close code first, then the error is
    /// delivered to the consumer.
    pub async fn poll_messages(&mut self) -> Result<(), Error> {
        loop {
            match self.next_frame().await {
                Ok(Some(frame)) => {
                    if !self.handle_frame(frame).await? {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    // Peer vanished without a close frame.
                    if !self.close_received {
                        let error = Error::ClosedByPeer {
                            code: close_code::ABNORMAL,
                            reason: "connection reset without close frame".into(),
                        };
                        let _ = self.read_tx.send(Err(error)).await;
                    }
                    return Ok(());
                }
                Err(error) => {
                    self.fail(&error).await;
                    let _ = self
                        .read_tx
                        .send(Err(Error::ClosedByPeer {
                            code: error.close_code().unwrap_or(close_code::ABNORMAL),
                            reason: error.to_string(),
                        }))
                        .await;
                    return Err(error);
                }
            }
        }
    }

    /// Reads until one full frame is available. `None` means clean EOF.
    async fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            match self.codec.decode(&mut self.buffer) {
                Decoded::Frame(frame) => return Ok(Some(frame)),
                Decoded::Bad(error) => return Err(error),
                Decoded::NeedMore => {}
            }
            let n = self.read_half.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }

    /// Returns false when the connection is done (close handshake finished).
    async fn handle_frame(&mut self, frame: Frame) -> Result<bool, Error> {
        match frame.opcode {
            // A new fragmented message begins with a data opcode and FIN=0.
            OpCode::Text | OpCode::Binary if !frame.final_fragment => {
                if self.fragmented_message.is_some() {
                    return Err(Error::FragmentedInProgress);
                }
                self.fragmented_message = Some(FragmentedMessage {
                    op_code: frame.opcode,
                    fragments: frame.payload,
                    compressed: frame.compressed,
                });
                Ok(true)
            }
            OpCode::Continue => {
                let assembled = {
                    let fragmented = self
                        .fragmented_message
                        .as_mut()
                        .ok_or(Error::InvalidContinuationFrame)?;
                    fragmented.fragments.extend_from_slice(&frame.payload);
                    if fragmented.fragments.len()
                        > self.config.max_message_size.unwrap_or(usize::MAX)
                    {
                        return Err(Error::MaxMessageSize);
                    }
                    frame.final_fragment
                };
                if assembled {
                    let mut finished = match self.fragmented_message.take() {
                        Some(message) => message,
                        None => return Err(Error::InvalidContinuationFrame),
                    };
                    if finished.compressed {
                        finished.fragments = self.inflate(&finished.fragments)?;
                    }
                    self.transmit_message(Frame::new(
                        true,
                        finished.op_code,
                        finished.fragments,
                        false,
                    ))
                    .await?;
                }
                Ok(true)
            }
            OpCode::Text | OpCode::Binary => {
                // A whole new data frame while a message is being reassembled
                // breaks the fragmentation rules.
                if self.fragmented_message.is_some() {
                    return Err(Error::InvalidFrameFragmentation);
                }
                let mut frame = frame;
                if frame.compressed {
                    frame.payload = self.inflate(&frame.payload)?;
                    frame.compressed = false;
                }
                if frame.payload.len() > self.config.max_message_size.unwrap_or(usize::MAX) {
                    return Err(Error::MaxMessageSize);
                }
                self.transmit_message(frame).await?;
                Ok(true)
            }
            OpCode::Close => {
                let (code, reason) = Frame::parse_close(&frame.payload);
                debug!("ws: peer closed with {} {}", code, reason);
                self.close_received = true;
                // Answer the close once, then stop reading.
                let _ = self
                    .writer
                    .lock()
                    .await
                    .write_close(if code == close_code::NO_STATUS {
                        close_code::NORMAL
                    } else {
                        code
                    }, "")
                    .await;
                if code != close_code::NORMAL && code != close_code::NO_STATUS {
                    let _ = self
                        .read_tx
                        .send(Err(Error::ClosedByPeer { code, reason }))
                        .await;
                }
                Ok(false)
            }
            OpCode::Ping => {
                self.send_pong_frame(frame.payload).await?;
                Ok(true)
            }
            OpCode::Pong => {
                self.ping.touch_pong();
                Ok(true)
            }
        }
    }

    fn inflate(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        match self.decoder.as_mut() {
            Some(decoder) => decoder.decompress(payload),
            // RSV1 without negotiation is caught by the codec already.
            None => Err(Error::RSVNotZero),
        }
    }

    async fn send_pong_frame(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        let pong_frame = Frame::new(true, OpCode::Pong, payload, false);
        self.writer.lock().await.write_frame(pong_frame).await
    }

    /// Announces a protocol violation to the peer, unless the socket is
    /// already beyond use.
    async fn fail(&mut self, error: &Error) {
        if let Some(code) = error.close_code() {
            let _ = self
                .writer
                .lock()
                .await
                .write_close(code, &error.to_string())
                .await;
        }
    }

    async fn transmit_message(&mut self, frame: Frame) -> Result<(), Error> {
        // Text payloads must be valid UTF-8 once reassembled.
        if frame.opcode == OpCode::Text {
            let _ = String::from_utf8(frame.payload.clone())?;
        }
        self.read_tx
            .send(Ok(Message::from_frame(frame)?))
            .await
            .map_err(|_| Error::CommunicationError)
    }
}
