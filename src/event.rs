use crate::error::Error;
use crate::message::Message;
use crate::split::WSWriter;
use futures::Stream;
use rand::{thread_rng, Rng};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

pub type ID = Uuid;

// Fresh id for every client the server accepts
pub fn generate_new_uuid() -> Uuid {
    let buf = thread_rng().gen::<[u8; 16]>();
    Uuid::new_v8(buf)
}

/// Everything a running server reports to the application, one value per
/// happening, in arrival order.
pub enum Event {
    NewClient(ID, WSWriter),
    NewMessage(ID, Message),
    Disconnect(ID),
    Error(ID, Error),
}

/// Stream wrapper over the server's event channel, so applications consume
/// events with `StreamExt::next` instead of touching the channel directly.
pub struct EventStream {
    receiver: Receiver<Event>,
}

impl EventStream {
    pub fn new(receiver: Receiver<Event>) -> Self {
        Self { receiver }
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver).poll_recv(cx)
    }
}
