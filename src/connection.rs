//! Per-connection engine: drives the handshake, the frame codec, message assembly,
//! and the control plane for one accepted socket.
//!
//! Each connection is two cooperatively scheduled tasks sharing one `Subscriber`
//! handle: a reader (owns the read half, parses frames, applies pub/sub commands) and
//! a writer (owns the write half, drains the subscriber's outbox and ticks the
//! keep-alive PING). Splitting them this way means neither task ever awaits a socket
//! operation while also holding a `select!` branch that could cancel a
//! multi-step read mid-frame — a single persistent `read_exact` sequence per task,
//! never raced against anything else.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::control::{self, ControlAction, PingClock};
use crate::envelope::{self, InboundEnvelope};
use crate::error::ConnectionError;
use crate::frame::{self, Opcode};
use crate::handshake::{self, Request};
use crate::message::{Assembler, Message};
use crate::pubsub::{Broker, ChannelAction, Registry, Subscriber};

/// A connection with no read activity for this long is closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Keep-alive PING cadence.
const PING_PERIOD: Duration = Duration::from_secs(30);
/// Guard against a client that never sends a newline during the handshake.
const MAX_HEADER_LINE: usize = 8 * 1024;

/// Drive one accepted connection end to end; never panics, logs and returns instead.
/// `shutdown` mirrors `BrokerBridge::run`'s own shutdown handling: when it flips to
/// `true`, the reader loop exits cooperatively and the connection tears down through
/// its normal path (unsubscribe, drain, shutdown) rather than being aborted.
pub async fn handle<B: Broker + Clone + 'static>(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Rc<RefCell<Registry>>,
    broker: B,
    shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let span = info_span!("conn", %peer);
    async move {
        if let Err(err) = run(stream, registry, broker, shutdown).await {
            warn!(%err, "connection ended");
        }
    }
    .instrument(span)
    .await;
}

async fn run<B: Broker + Clone + 'static>(
    stream: TcpStream,
    registry: Rc<RefCell<Registry>>,
    broker: B,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), ConnectionError> {
    let (rx_half, mut tx_half) = stream.into_split();
    let mut rx = BufReader::new(rx_half);

    let request = read_request(&mut rx).await?;
    match handshake::handle(&request) {
        Ok(response) => {
            tx_half.write_all(&response.to_bytes()).await?;
            info!("handshake accepted");
        }
        Err((err, response)) => {
            tx_half.write_all(&response.to_bytes()).await?;
            debug!(%err, "handshake rejected");
            return Ok(());
        }
    }

    let subscriber = Subscriber::new();
    let closed = Rc::new(Cell::new(false));

    let writer = tokio::task::spawn_local(writer_loop(tx_half, subscriber.clone(), closed.clone()));

    let result = reader_loop(rx, subscriber.clone(), registry.clone(), broker.clone(), shutdown).await;

    closed.set(true);
    subscriber.inner().notify.notify_one();
    let _ = writer.await;

    let actions = registry.borrow_mut().unsubscribe_all(&subscriber);
    for action in actions {
        if let ChannelAction::Unsubscribe(channel) = action {
            broker.unsubscribe(channel.as_str()).await;
        }
    }

    result
}

async fn reader_loop<B: Broker>(
    mut rx: BufReader<OwnedReadHalf>,
    subscriber: Subscriber,
    registry: Rc<RefCell<Registry>>,
    broker: B,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), ConnectionError> {
    let mut assembler = Assembler::new();
    loop {
        let (opcode, is_final, payload) = tokio::select! {
            result = tokio::time::timeout(IDLE_TIMEOUT, read_frame(&mut rx)) => {
                match result {
                    Ok(result) => result?,
                    Err(_elapsed) => return Err(ConnectionError::Timeout),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
        };

        if opcode.is_control() {
            match control::handle(opcode, payload) {
                ControlAction::Pong(reply) => {
                    subscriber.enqueue(frame::encode_frame(Opcode::Pong, &reply));
                }
                ControlAction::None => {}
                ControlAction::Close => return Ok(()),
            }
            continue;
        }

        match assembler.feed(opcode, is_final, payload) {
            Ok(Some(message)) => dispatch_message(message, &subscriber, &registry, &broker).await,
            Ok(None) => {}
            Err(err) => return Err(ConnectionError::Protocol(err)),
        }
    }
}

async fn dispatch_message<B: Broker>(
    message: Message,
    subscriber: &Subscriber,
    registry: &Rc<RefCell<Registry>>,
    broker: &B,
) {
    let Message::Text(bytes) = message else {
        warn!("dropping binary message: the application envelope is JSON text only");
        return;
    };
    let text = match std::str::from_utf8(&bytes) {
        Ok(text) => text,
        Err(_) => {
            warn!("dropping non-UTF-8 text message");
            return;
        }
    };
    let parsed = match envelope::parse_inbound(text) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(%err, "dropping malformed application envelope");
            return;
        }
    };
    match parsed {
        InboundEnvelope::Subscribe { key } => {
            let action = registry.borrow_mut().subscribe(&key, subscriber.clone());
            if let Some(ChannelAction::Subscribe(channel)) = action {
                broker.subscribe(channel.as_str()).await;
            }
        }
        InboundEnvelope::Unsubscribe { key } => {
            let action = registry.borrow_mut().unsubscribe(&key, subscriber);
            if let Some(ChannelAction::Unsubscribe(channel)) = action {
                broker.unsubscribe(channel.as_str()).await;
            }
        }
        InboundEnvelope::Publish { key, data } => {
            broker.publish(&key, data.as_bytes()).await;
        }
    }
}

/// The writer side: drains `subscriber`'s outbox whenever it's notified and ticks the
/// keep-alive PING. Exits and shuts down the socket exactly once `closed` is set by
/// the reader side.
async fn writer_loop(mut tx: OwnedWriteHalf, subscriber: Subscriber, closed: Rc<Cell<bool>>) {
    let mut ping_clock = PingClock::new();
    let mut ping_interval = tokio::time::interval(PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.tick().await; // the first tick fires immediately; consume it

    loop {
        if closed.get() {
            drain(&subscriber, &mut tx).await;
            let _ = tx.shutdown().await;
            return;
        }
        tokio::select! {
            _ = subscriber.inner().notify.notified() => {
                drain(&subscriber, &mut tx).await;
            }
            _ = ping_interval.tick() => {
                let frame = ping_clock.next_ping_frame();
                if tx.write_all(&frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn drain(subscriber: &Subscriber, tx: &mut OwnedWriteHalf) {
    loop {
        let frame = subscriber.inner().outbox.borrow_mut().pop_front();
        let Some(frame) = frame else {
            return;
        };
        if tx.write_all(&frame).await.is_err() {
            return;
        }
    }
}

/// Read one RFC 6455 frame header plus payload, unmasking as it goes: initial two
/// bytes, optional extended length, masking key, then payload, as a single
/// straight-line sequence of exact reads.
async fn read_frame<R: AsyncRead + Unpin>(rx: &mut R) -> Result<(Opcode, bool, Vec<u8>), ConnectionError> {
    let mut initial = [0u8; 2];
    rx.read_exact(&mut initial).await?;
    let header = frame::decode_initial(initial)?;

    let payload_len = match header.length {
        frame::LengthField::Known(n) => n,
        frame::LengthField::Extended16 => {
            let mut buf = [0u8; 2];
            rx.read_exact(&mut buf).await?;
            u16::from_be_bytes(buf) as u64
        }
        frame::LengthField::Extended64 => {
            let mut buf = [0u8; 8];
            rx.read_exact(&mut buf).await?;
            u64::from_be_bytes(buf)
        }
    };
    frame::check_payload_len(payload_len)?;

    let mut mask_key = [0u8; 4];
    rx.read_exact(&mut mask_key).await?;

    let mut payload = vec![0u8; payload_len as usize];
    rx.read_exact(&mut payload).await?;
    frame::unmask(&mut payload, mask_key);

    Ok((header.opcode, header.is_final, payload))
}

fn io_err(message: &str) -> ConnectionError {
    ConnectionError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string()))
}

async fn read_delimited<R: AsyncBufRead + Unpin>(rx: &mut R, delim: u8, buf: &mut Vec<u8>) -> Result<(), ConnectionError> {
    let n = rx.read_until(delim, buf).await?;
    if n == 0 {
        return Err(ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "EOF during handshake",
        )));
    }
    if buf.len() > MAX_HEADER_LINE {
        return Err(io_err("header line too long"));
    }
    Ok(())
}

/// Read the HTTP/1.1 request line and headers one delimiter-bounded read at a time;
/// no HTTP parsing crate is involved.
async fn read_request<R: AsyncBufRead + Unpin>(rx: &mut R) -> Result<Request, ConnectionError> {
    let mut method = Vec::new();
    let mut uri = Vec::new();
    let mut version_line = Vec::new();
    read_delimited(rx, b' ', &mut method).await?;
    read_delimited(rx, b' ', &mut uri).await?;
    read_delimited(rx, b'\n', &mut version_line).await?;

    let version = String::from_utf8_lossy(&version_line).trim().to_string();
    let (version_major, version_minor) = parse_http_version(&version)?;

    let mut headers = HashMap::new();
    loop {
        let mut line = Vec::new();
        read_delimited(rx, b'\n', &mut line).await?;
        let line = String::from_utf8_lossy(&line);
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Ok(Request {
        version_major,
        version_minor,
        headers,
    })
}

fn parse_http_version(s: &str) -> Result<(u8, u8), ConnectionError> {
    let rest = s.strip_prefix("HTTP/").ok_or_else(|| io_err("missing HTTP version"))?;
    let (major, minor) = rest.split_once('.').ok_or_else(|| io_err("malformed HTTP version"))?;
    let major: u8 = major.parse().map_err(|_| io_err("malformed HTTP version"))?;
    let minor: u8 = minor.parse().map_err(|_| io_err("malformed HTTP version"))?;
    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::broker::test_support::RecordingBroker;
    use tokio::io::{duplex, AsyncReadExt as _};

    fn handshake_request() -> Vec<u8> {
        b"GET /ws HTTP/1.1\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Origin: http://a\r\n\
Sec-WebSocket-Version: 13\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
\r\n"
            .to_vec()
    }

    #[tokio::test]
    async fn parses_request_line_and_headers() {
        let (mut client, server) = duplex(4096);
        client.write_all(&handshake_request()).await.unwrap();
        let mut rx = BufReader::new(server);
        let request = read_request(&mut rx).await.unwrap();
        assert_eq!(request.version_major, 1);
        assert_eq!(request.version_minor, 1);
        assert_eq!(request.headers.get("upgrade").unwrap(), "websocket");
        assert_eq!(request.headers.get("sec-websocket-key").unwrap(), "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[tokio::test]
    async fn rejects_handshake_missing_origin() {
        let request = b"GET /ws HTTP/1.1\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Version: 13\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
\r\n";
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(request).await.unwrap();
        let server_stream = accept.await.unwrap();

        let local = tokio::task::LocalSet::new();
        let registry = Rc::new(RefCell::new(Registry::new()));
        let broker = RecordingBroker::default();
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        local
            .run_until(async move {
                handle(server_stream, addr, registry, broker, shutdown_rx).await;
            })
            .await;

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 403"));
    }

    #[tokio::test]
    async fn accepts_handshake_and_echoes_ping_as_pong_then_supports_pub_sub() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(&handshake_request()).await.unwrap();
        let server_stream = accept.await.unwrap();

        let registry = Rc::new(RefCell::new(Registry::new()));
        let broker = RecordingBroker::default();

        let mut response_buf = [0u8; 256];
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let handle_fut = tokio::task::spawn_local(handle(
                    server_stream,
                    addr,
                    registry.clone(),
                    broker.clone(),
                    shutdown_rx,
                ));

                // Read the 101 response.
                let n = client.read(&mut response_buf).await.unwrap();
                let response = String::from_utf8_lossy(&response_buf[..n]);
                assert!(response.starts_with("HTTP/1.1 101"));

                // Send a masked PING, expect an unmasked PONG with the same payload.
                let ping = {
                    let mut frame = vec![0x89u8, 0x84]; // FIN+PING, masked, len=4
                    let key = [0x00u8, 0x00, 0x00, 0x00];
                    frame.extend_from_slice(&key);
                    frame.extend_from_slice(b"ping");
                    frame
                };
                client.write_all(&ping).await.unwrap();
                let n = client.read(&mut response_buf).await.unwrap();
                assert_eq!(response_buf[0], 0x8A); // PONG, FIN set
                assert_eq!(&response_buf[2..n], b"ping");

                // Subscribe to "x", then drop the client to trigger teardown.
                let sub_frame = {
                    let payload = br#"{"action":"sub","key":"x"}"#;
                    let mut frame = vec![0x81u8, 0x80 | payload.len() as u8];
                    frame.extend_from_slice(&[0, 0, 0, 0]);
                    frame.extend_from_slice(payload);
                    frame
                };
                client.write_all(&sub_frame).await.unwrap();
                // give the reader a moment to process the subscribe before we drop
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(client);
                handle_fut.await.unwrap();
            })
            .await;
    }
}
