use futures::StreamExt;
use log::*;
use std::collections::HashMap;
use wireflow::event::Event;
use wireflow::server::start_server;

#[tokio::main]
async fn main() {
    env_logger::init();

    match start_server(9002).await {
        Ok(mut events) => {
            info!("Listening on port 9002");
            let mut writers = HashMap::new();
            while let Some(event) = events.next().await {
                match event {
                    Event::NewClient(id, writer) => {
                        info!("client {} connected", id);
                        writers.insert(id, writer);
                    }
                    Event::NewMessage(id, message) => {
                        if let Some(writer) = writers.get_mut(&id) {
                            if writer.send_message(message).await.is_err() {
                                warn!("failed to echo to client {}", id);
                            }
                        }
                    }
                    Event::Disconnect(id) => {
                        info!("client {} disconnected", id);
                        writers.remove(&id);
                    }
                    Event::Error(id, err) => {
                        error!("client {} error: {}", id, err);
                    }
                }
            }
        }
        Err(err) => error!("could not start server: {}", err),
    }
}
