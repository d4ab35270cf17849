use crate::compression::{Decoder, Encoder};
use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::extensions::Extensions;
use crate::frame::{close_code, Frame, OpCode, Role};
use crate::message::Message;
use crate::read::{PingTracker, ReadStream};
use crate::stream::BoxStream;
use crate::write::Writer;
use bytes::BytesMut;
use futures::Stream;
use log::{debug, warn};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

const PAYLOAD_SIZE_COMPRESSION_ENABLE: usize = 1;

/// Liveness probing parameters, used on client connections when pinging is
/// enabled.
#[derive(Debug, Clone)]
pub struct PingConfig {
    pub interval: Duration,
    pub wait_pong: Duration,
    /// Goes into the PING payload so pongs can be traced in logs.
    pub broker_id: u64,
}

pub struct WSReader {
    read_rx: ReceiverStream<Result<Message, Error>>,
}

impl WSReader {
    pub fn new(read_rx: ReceiverStream<Result<Message, Error>>) -> Self {
        Self { read_rx }
    }
}

impl Stream for WSReader {
    type Item = Result<Message, Error>;
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.read_rx).poll_next(cx)
    }
}

pub struct WSWriter {
    pub writer: Arc<AsyncMutex<Writer>>,
    pub web_socket_config: WebSocketConfig,
    encoder: Option<Encoder>,
    ping: Arc<PingTracker>,
}

impl WSWriter {
    pub fn new(
        writer: Arc<AsyncMutex<Writer>>,
        web_socket_config: WebSocketConfig,
        encoder: Option<Encoder>,
        ping: Arc<PingTracker>,
    ) -> Self {
        Self {
            writer,
            web_socket_config,
            encoder,
            ping,
        }
    }

    /// Starts the closing handshake with a normal close code, leaving the
    /// peer a moment to answer before the connection is dropped.
    pub async fn close_connection(&mut self) -> Result<(), Error> {
        self.close_with(close_code::NORMAL, "").await
    }

    pub async fn close_with(&mut self, code: u16, reason: &str) -> Result<(), Error> {
        self.writer.lock().await.write_close(code, reason).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }

    pub async fn send_message(&mut self, message: Message) -> Result<(), Error> {
        self.write_message(message).await
    }

    // Bytes go out as a text message for parity with the original API.
    pub async fn send(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.write_message(Message::Text(String::from_utf8(data)?))
            .await
    }

    pub async fn send_as_binary(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.write_message(Message::Binary(data)).await
    }

    pub async fn send_as_text(&mut self, data: String) -> Result<(), Error> {
        self.write_message(Message::Text(data)).await
    }

    pub async fn send_ping(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.ping.touch_ping_sent();
        self.writer
            .lock()
            .await
            .write_frame(Frame::new(true, OpCode::Ping, payload, false))
            .await
    }

    pub async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.writer
            .lock()
            .await
            .write_frame(Frame::new(true, OpCode::Pong, payload, false))
            .await
    }

    /// Splits a large payload into fragments of `fragment_size` bytes each.
    pub async fn send_large_data_fragmented(
        &mut self,
        data: Vec<u8>,
        fragment_size: usize,
    ) -> Result<(), Error> {
        let max_frame = self.web_socket_config.max_frame_size.unwrap_or(usize::MAX);
        if fragment_size > max_frame {
            return Err(Error::CustomFragmentSizeExceeded(fragment_size, max_frame));
        }
        if data.len() > self.web_socket_config.max_message_size.unwrap_or(usize::MAX) {
            return Err(Error::MaxMessageSize);
        }

        let mut payload = data;
        let compressed = self.check_compression(&mut payload)?;
        for frame in Message::Binary(payload).to_frames(fragment_size, compressed) {
            self.writer.lock().await.write_frame(frame).await?;
        }
        Ok(())
    }

    fn check_compression(&mut self, data: &mut Vec<u8>) -> Result<bool, Error> {
        if let Some(encoder) = self.encoder.as_mut() {
            if data.len() > PAYLOAD_SIZE_COMPRESSION_ENABLE {
                *data = encoder.compress(data)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn write_message(&mut self, message: Message) -> Result<(), Error> {
        if message.as_binary().len() > self.web_socket_config.max_message_size.unwrap_or(usize::MAX)
        {
            return Err(Error::MaxMessageSize);
        }

        let opcode = message.opcode();
        let mut payload = message.into_payload();
        let compressed = self.check_compression(&mut payload)?;

        let segment_size = self
            .web_socket_config
            .fragment_size
            .or(self.web_socket_config.max_frame_size)
            .unwrap_or(usize::MAX);
        let restored = match opcode {
            OpCode::Text if !compressed => {
                Message::Text(String::from_utf8(payload)?)
            }
            // Deflated text is opaque bytes until the peer inflates it; the
            // opcode still announces text.
            _ => Message::Binary(payload),
        };
        let mut frames = restored.to_frames(segment_size, compressed);
        for frame in frames.iter_mut() {
            if frame.opcode != OpCode::Continue {
                frame.opcode = opcode;
            }
        }
        for frame in frames {
            self.writer.lock().await.write_frame(frame).await?;
        }
        Ok(())
    }
}

/// A live Websocket connection: stream of inbound messages plus the writer
/// half, with the read loop and the optional ping loop running as tasks.
pub struct WSConnection {
    reader: WSReader,
    writer: WSWriter,
    subprotocol: Option<String>,
    _read_task: JoinHandle<()>,
    ping_task: Option<JoinHandle<()>>,
}

impl WSConnection {
    /// Wires a handshaken transport into reader/writer tasks.
    pub fn spawn(
        stream: BoxStream,
        role: Role,
        config: WebSocketConfig,
        extensions: Option<Extensions>,
        subprotocol: Option<String>,
        leftover: BytesMut,
        ping_config: Option<PingConfig>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = Arc::new(AsyncMutex::new(Writer::new(write_half, role)));
        let ping = Arc::new(PingTracker::default());

        let (encoder, decoder) = match &extensions {
            Some(ext) if ext.permessage_deflate => {
                // Which takeover flag controls which context depends on the
                // side: the client compresses under client_no_context_takeover
                // and inflates under server_no_context_takeover.
                let (enc_reset, dec_reset) = match role {
                    Role::Client => (
                        ext.client_no_context_takeover == Some(true),
                        ext.server_no_context_takeover == Some(true),
                    ),
                    Role::Server => (
                        ext.server_no_context_takeover == Some(true),
                        ext.client_no_context_takeover == Some(true),
                    ),
                };
                (Some(Encoder::new(enc_reset)), Some(Decoder::new(dec_reset)))
            }
            _ => (None, None),
        };

        let (read_tx, read_rx) = mpsc::channel(128);

        let mut read_stream = ReadStream::new(
            read_half,
            role,
            read_tx.clone(),
            writer.clone(),
            config.clone(),
            decoder,
            ping.clone(),
            leftover,
        );
        let read_task = tokio::spawn(async move {
            if let Err(e) = read_stream.poll_messages().await {
                debug!("ws: read loop ended with {}", e);
            }
        });

        let ping_task = ping_config.map(|cfg| {
            let writer = writer.clone();
            let tracker = ping.clone();
            let errors = read_tx;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cfg.interval / 2);
                ticker.tick().await; // first tick fires immediately
                loop {
                    ticker.tick().await;
                    if tracker.since_pong() >= cfg.wait_pong {
                        warn!(
                            "ws: broker {} got no pong for {:?}, closing",
                            cfg.broker_id, cfg.wait_pong
                        );
                        let _ = writer
                            .lock()
                            .await
                            .write_close(close_code::NO_STATUS, "PING response not received")
                            .await;
                        let _ = errors.send(Err(Error::PongTimeout)).await;
                        break;
                    }
                    if tracker.since_ping_sent() >= cfg.interval / 2 {
                        tracker.touch_ping_sent();
                        let payload = cfg.broker_id.to_be_bytes().to_vec();
                        let frame = Frame::new(true, OpCode::Ping, payload, false);
                        if writer.lock().await.write_frame(frame).await.is_err() {
                            break;
                        }
                    }
                }
            })
        });

        let ws_writer = WSWriter::new(writer, config, encoder, ping);
        Self {
            reader: WSReader::new(ReceiverStream::new(read_rx)),
            writer: ws_writer,
            subprotocol,
            _read_task: read_task,
            ping_task,
        }
    }

    /// Subprotocol the server agreed to, when any was negotiated.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Shared handle to the raw frame writer, used by the orchestrator to
    /// close every live connection on `stop()`.
    pub(crate) fn writer_handle(&self) -> Arc<AsyncMutex<Writer>> {
        self.writer.writer.clone()
    }

    /// Hands out the two halves; the read and ping loops stay attached to
    /// the runtime and end on their own when the connection does.
    pub fn split(self) -> (WSReader, WSWriter) {
        (self.reader, self.writer)
    }

    pub async fn close_connection(&mut self) -> Result<(), Error> {
        let result = self.writer.close_connection().await;
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
        result
    }

    pub async fn send_message(&mut self, message: Message) -> Result<(), Error> {
        self.writer.send_message(message).await
    }

    pub async fn send(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.writer.send(data).await
    }

    pub async fn send_as_binary(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.writer.send_as_binary(data).await
    }

    pub async fn send_as_text(&mut self, data: String) -> Result<(), Error> {
        self.writer.send_as_text(data).await
    }

    pub async fn send_ping(&mut self) -> Result<(), Error> {
        self.writer.send_ping(Vec::new()).await
    }

    pub async fn send_large_data_fragmented(
        &mut self,
        data: Vec<u8>,
        fragment_size: usize,
    ) -> Result<(), Error> {
        self.writer
            .send_large_data_fragmented(data, fragment_size)
            .await
    }
}

impl Stream for WSConnection {
    type Item = Result<Message, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.reader).poll_next(cx)
    }
}

// Dropping the connection closes the message channel; the read loop then
// fails its next delivery and winds down, taking the socket with it. The
// spawned tasks are kept only so close_connection can stop the ping loop.

