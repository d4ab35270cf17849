//! End-to-end tests wiring the client and server halves together over real
//! sockets on the loopback interface.

use crate::client::WebClient;
use crate::config::{ClientConfig, ServerConfig, WebSocketConfig};
use crate::error::Error;
use crate::event::Event;
use crate::extensions::Extensions;
use crate::frame::close_code;
use crate::handshake::connect_async;
use crate::message::Message;
use crate::request::Request;
use crate::server::serve;
use crate::utils::generate_websocket_accept_value;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

/// Reads one HTTP head off the stream and returns it as text.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8(buf).unwrap()
}

/// Echo server used by the Websocket tests, answering every message and
/// reporting events like an application would see them.
async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut events = serve(listener, None).unwrap();

    tokio::spawn(async move {
        let mut writers = std::collections::HashMap::new();
        while let Some(event) = events.next().await {
            match event {
                Event::NewClient(id, writer) => {
                    writers.insert(id, writer);
                }
                Event::NewMessage(id, message) => {
                    if let Some(writer) = writers.get_mut(&id) {
                        let _ = writer.send_message(message).await;
                    }
                }
                Event::Disconnect(id) | Event::Error(id, _) => {
                    writers.remove(&id);
                }
            }
        }
    });
    port
}

#[tokio::test]
async fn test_ws_echo_roundtrip_in_order() {
    let port = spawn_echo_server().await;
    let mut connection = connect_async(&format!("ws://127.0.0.1:{}/echo", port))
        .await
        .unwrap();

    for text in ["first", "second", "third"] {
        connection.send_as_text(text.to_string()).await.unwrap();
    }
    // Responses observe submission order.
    for expected in ["first", "second", "third"] {
        let message = connection.next().await.unwrap().unwrap();
        assert_eq!(message, Message::Text(expected.to_string()));
    }
    connection.close_connection().await.unwrap();
}

#[tokio::test]
async fn test_ws_fragmented_message_reassembled() {
    let port = spawn_echo_server().await;
    let mut connection = connect_async(&format!("ws://127.0.0.1:{}/", port))
        .await
        .unwrap();

    let payload = vec![0x42u8; 10_000];
    connection
        .send_large_data_fragmented(payload.clone(), 1024)
        .await
        .unwrap();

    // The server reassembles the fragments before echoing, so one whole
    // message comes back.
    let message = connection.next().await.unwrap().unwrap();
    assert_eq!(message, Message::Binary(payload));
    connection.close_connection().await.unwrap();
}

#[tokio::test]
async fn test_ws_permessage_deflate_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server_config = ServerConfig {
        web_socket_config: Some(WebSocketConfig {
            extensions: Some(Extensions::deflate()),
            ..Default::default()
        }),
        tls_config: None,
    };
    let mut events = serve(listener, Some(server_config)).unwrap();
    tokio::spawn(async move {
        let mut writers = std::collections::HashMap::new();
        while let Some(event) = events.next().await {
            match event {
                Event::NewClient(id, writer) => {
                    writers.insert(id, writer);
                }
                Event::NewMessage(id, message) => {
                    if let Some(writer) = writers.get_mut(&id) {
                        let _ = writer.send_message(message).await;
                    }
                }
                Event::Disconnect(id) | Event::Error(id, _) => {
                    writers.remove(&id);
                }
            }
        }
    });

    let mut client_config = ClientConfig::default();
    client_config.web_socket_config.extensions = Some(Extensions::deflate());
    let client = WebClient::with_config(client_config);
    let mut connection = client
        .connect_ws(&format!("ws://127.0.0.1:{}/", port))
        .await
        .unwrap();

    // Repetitive payload so deflate actually bites, large enough to span
    // fragments on the way back.
    let text = "squeeze me ".repeat(4_000);
    connection.send_as_text(text.clone()).await.unwrap();
    let message = connection.next().await.unwrap().unwrap();
    assert_eq!(message.as_text().unwrap(), text);
    connection.close_connection().await.unwrap();
}

#[tokio::test]
async fn test_masked_server_frame_closes_1002_and_peers_survive() {
    // Hand-rolled server so it can violate the protocol on purpose.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                let key = head
                    .lines()
                    .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
                    .unwrap()
                    .trim();
                let path_is_bad = head.starts_with("GET /bad ");
                let response = format!(
                    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                     Connection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                    generate_websocket_accept_value(key)
                );
                stream.write_all(response.as_bytes()).await.unwrap();

                if path_is_bad {
                    // A masked text frame, which a server must never send.
                    let mask = [1u8, 2, 3, 4];
                    let payload: Vec<u8> = b"oops"
                        .iter()
                        .enumerate()
                        .map(|(i, b)| b ^ mask[i % 4])
                        .collect();
                    let mut frame = vec![0x81, 0x80 | 4];
                    frame.extend_from_slice(&mask);
                    frame.extend_from_slice(&payload);
                    stream.write_all(&frame).await.unwrap();

                    // Expect a close frame with code 1002 back.
                    let mut header = [0u8; 2];
                    stream.read_exact(&mut header).await.unwrap();
                    assert_eq!(header[0], 0x88);
                    let len = (header[1] & 0x7F) as usize;
                    let mut mask = [0u8; 4];
                    stream.read_exact(&mut mask).await.unwrap();
                    let mut payload = vec![0u8; len];
                    stream.read_exact(&mut payload).await.unwrap();
                    for (i, byte) in payload.iter_mut().enumerate() {
                        *byte ^= mask[i % 4];
                    }
                    let code = u16::from_be_bytes([payload[0], payload[1]]);
                    assert_eq!(code, close_code::PROTOCOL_ERROR);
                } else {
                    // Behave: echo one unmasked text frame.
                    let mut header = [0u8; 2];
                    stream.read_exact(&mut header).await.unwrap();
                    let len = (header[1] & 0x7F) as usize;
                    let mut mask = [0u8; 4];
                    stream.read_exact(&mut mask).await.unwrap();
                    let mut payload = vec![0u8; len];
                    stream.read_exact(&mut payload).await.unwrap();
                    for (i, byte) in payload.iter_mut().enumerate() {
                        *byte ^= mask[i % 4];
                    }
                    let mut frame = vec![0x81, payload.len() as u8];
                    frame.extend_from_slice(&payload);
                    stream.write_all(&frame).await.unwrap();
                }
            });
        }
    });

    let mut bad = connect_async(&format!("ws://127.0.0.1:{}/bad", port))
        .await
        .unwrap();
    let mut good = connect_async(&format!("ws://127.0.0.1:{}/good", port))
        .await
        .unwrap();

    // The violated connection reports the protocol error.
    let error = bad.next().await.unwrap().unwrap_err();
    match error {
        Error::ClosedByPeer { code, reason } => {
            assert_eq!(code, close_code::PROTOCOL_ERROR);
            assert!(reason.contains("Masked frame from server"));
        }
        other => panic!("expected 1002 teardown, got {:?}", other),
    }

    // The other client is unaffected.
    good.send_as_text("ping".to_string()).await.unwrap();
    let message = good.next().await.unwrap().unwrap();
    assert_eq!(message, Message::Text("ping".to_string()));
}

#[tokio::test]
async fn test_http_get_roundtrip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("GET /hello HTTP/1.1\r\n"));
        assert!(head.contains("Accept-Encoding: gzip, deflate\r\n"));
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nworld")
            .await
            .unwrap();
    });

    let client = WebClient::new();
    let response = client
        .get(&format!("http://127.0.0.1:{}/hello", port))
        .await
        .unwrap();
    assert!(response.ok());
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"world");
}

#[tokio::test]
async fn test_http_redirect_followed_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        // First connection: redirect. Second: the real content.
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("GET /old HTTP/1.1\r\n"));
        stream
            .write_all(
                b"HTTP/1.1 301 Moved Permanently\r\nLocation: /new\r\nContent-Length: 0\r\n\r\n",
            )
            .await
            .unwrap();

        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("GET /new HTTP/1.1\r\n"));
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nlanded")
            .await
            .unwrap();
    });

    let client = WebClient::new();
    let response = client
        .get(&format!("http://127.0.0.1:{}/old", port))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"landed");
}

#[tokio::test]
async fn test_http_redirects_disabled_reports_status() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_head(&mut stream).await;
        stream
            .write_all(
                b"HTTP/1.1 302 Found\r\nLocation: http://elsewhere/\r\nContent-Length: 0\r\n\r\n",
            )
            .await
            .unwrap();
    });

    let config = ClientConfig {
        follow_redirects: false,
        ..Default::default()
    };
    let client = WebClient::with_config(config);
    let response = client
        .get(&format!("http://127.0.0.1:{}/", port))
        .await
        .unwrap();
    assert_eq!(response.status, 302);
}

#[tokio::test]
async fn test_http_basic_auth_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        assert!(!head.contains("Authorization:"));
        stream
            .write_all(
                b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"api\"\r\n\
                  Content-Length: 0\r\n\r\n",
            )
            .await
            .unwrap();

        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        // u:p base64-encodes to dTpw.
        assert!(head.contains("Authorization: Basic dTpw\r\n"));
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
    });

    let config = ClientConfig {
        credentials: Some(crate::auth::Credentials::new("u", "p")),
        ..Default::default()
    };
    let client = WebClient::with_config(config);
    let response = client
        .get(&format!("http://127.0.0.1:{}/secret", port))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"ok");
}

#[tokio::test]
async fn test_execute_many_keeps_submission_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for body in ["one", "two", "three"] {
            let _ = read_head(&mut stream).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        }
    });

    let client = WebClient::new();
    let base = format!("http://127.0.0.1:{}", port);
    let requests = vec![
        Request::get(Url::parse(&format!("{}/1", base)).unwrap()),
        Request::get(Url::parse(&format!("{}/2", base)).unwrap()),
        Request::get(Url::parse(&format!("{}/3", base)).unwrap()),
    ];
    let responses = client.execute_many(requests).await.unwrap();
    let bodies: Vec<&[u8]> = responses.iter().map(|r| r.body.as_slice()).collect();
    assert_eq!(bodies, vec![b"one".as_slice(), b"two", b"three"]);
}

#[tokio::test]
async fn test_chunked_response_body() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_head(&mut stream).await;
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nchunk\r\n2\r\ned\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
    });

    let client = WebClient::new();
    let response = client
        .get(&format!("http://127.0.0.1:{}/", port))
        .await
        .unwrap();
    assert_eq!(response.body, b"chunked");
}

#[tokio::test]
async fn test_plain_http_through_proxy_uses_absolute_form_and_basic_auth() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("GET http://example.com/ HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic dTpw\r\n"));
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbody")
            .await
            .unwrap();
    });

    let proxy_url = Url::parse(&format!("http://u:p@127.0.0.1:{}", port)).unwrap();
    let config = ClientConfig {
        proxy: Some(crate::proxy::ProxyConfig::from_url(proxy_url).unwrap()),
        ..Default::default()
    };
    let client = WebClient::with_config(config);
    let response = client.get("http://example.com/").await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"body");
}

#[tokio::test]
async fn test_stop_is_idempotent_and_blocks_new_work() {
    let client = WebClient::new();
    client.stop();
    client.stop();

    let result = client.get("http://127.0.0.1:1/").await;
    assert!(result.is_err());
}
