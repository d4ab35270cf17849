use crate::config::ServerConfig;
use crate::event::{generate_new_uuid, Event, EventStream};
use crate::handshake::accept_async_with_config;
use crate::stream::NetStream;
use futures::StreamExt;
use log::{debug, error};
use std::io::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsStream};

/// A ready to use websockets server.
///
/// Binds the port, accepts TCP (and optionally TLS) connections, runs the
/// upgrade handshake on each and forwards everything that happens as an
/// [`EventStream`]: new clients with their writer half, inbound messages,
/// disconnects and errors.
pub async fn start_server_with_config(
    port: u16,
    config: Option<ServerConfig>,
) -> Result<EventStream, Error> {
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    serve(listener, config)
}

pub async fn start_server(port: u16) -> Result<EventStream, Error> {
    start_server_with_config(port, None).await
}

/// Same as [`start_server_with_config`] but on an already bound listener,
/// which also reports the ephemeral port in tests.
pub fn serve(listener: TcpListener, config: Option<ServerConfig>) -> Result<EventStream, Error> {
    let (tx, rx) = mpsc::channel(1000);
    let web_socket_config = config.clone().unwrap_or_default().web_socket_config;
    let tls_config = config.unwrap_or_default().tls_config;

    tokio::spawn(async move {
        loop {
            let uuid = generate_new_uuid();
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("server: connection from {}", peer);
                    let socket_stream = if let Some(config) = tls_config.clone() {
                        let acceptor = TlsAcceptor::from(config);
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => NetStream::Secure(Box::new(TlsStream::from(tls_stream))),
                            Err(err) => {
                                if tx.send(Event::Error(uuid, err.into())).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        }
                    } else {
                        NetStream::Plain(stream)
                    };

                    let server_config = ServerConfig {
                        web_socket_config: web_socket_config.clone(),
                        tls_config: None,
                    };
                    let ws_connection =
                        match accept_async_with_config(socket_stream, Some(server_config)).await {
                            Ok(conn) => conn,
                            Err(err) => {
                                if tx.send(Event::Error(uuid, err)).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };

                    // Inbound messages drain in their own task so the accept
                    // loop keeps going; the writer goes to the application.
                    let (mut ws_reader, ws_writer) = ws_connection.split();
                    if tx.send(Event::NewClient(uuid, ws_writer)).await.is_err() {
                        break;
                    }

                    let tx_task = tx.clone();
                    tokio::spawn(async move {
                        while let Some(result) = ws_reader.next().await {
                            let event = match result {
                                Ok(message) => Event::NewMessage(uuid, message),
                                Err(err) => {
                                    let _ = tx_task.send(Event::Error(uuid, err)).await;
                                    break;
                                }
                            };
                            if tx_task.send(event).await.is_err() {
                                break;
                            }
                        }
                        let _ = tx_task.send(Event::Disconnect(uuid)).await;
                    });
                }
                Err(err) => {
                    error!("server: accept failed: {}", err);
                    if tx.send(Event::Error(uuid, err.into())).await.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }
    });

    Ok(EventStream::new(rx))
}
