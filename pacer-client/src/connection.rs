//! Connection management and the request/reply cycle.

use crate::error::ClientError;
use crate::stream::ClientStream;
use pacer_protocol::{
    Control, Decoder, Encoder, Order, ProtocolError, Reply, ReplyCode, SEQUENCE_MODULUS,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default read buffer size (1 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Default number of retransmissions before the link is declared faulted.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Time to wait for a reply before retransmitting.
    pub request_timeout: Duration,
    /// Retransmissions of one request before giving up.
    pub max_retries: u32,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_millis(500),
            max_retries: DEFAULT_MAX_RETRIES,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Link state owned by whichever request currently holds the lock.
struct Link {
    stream: ClientStream,
    decoder: Decoder,
    buf: Vec<u8>,
    sequence: u8,
    resync: bool,
}

enum Outcome {
    Reply(Reply),
    Retransmit(&'static str),
}

impl Link {
    /// Writes one request and waits up to `timeout` for its reply.
    async fn exchange(
        &mut self,
        encoded: &[u8],
        sequence: u8,
        timeout: Duration,
    ) -> Result<Outcome, ClientError> {
        self.stream.write_all(encoded).await?;
        self.stream.flush().await?;
        match tokio::time::timeout(timeout, self.read_reply(sequence)).await {
            Ok(result) => result,
            Err(_) => Ok(Outcome::Retransmit("reply timed out")),
        }
    }

    /// Reads until a reply carrying `sequence` arrives.
    async fn read_reply(&mut self, sequence: u8) -> Result<Outcome, ClientError> {
        loop {
            match self.decoder.decode_frame() {
                Ok(Some(frame)) => {
                    let reply = Reply::from_frame(frame)?;
                    if reply.control.sequence() != sequence {
                        debug!(
                            expected = sequence,
                            got = reply.control.sequence(),
                            "Discarding stale reply"
                        );
                        continue;
                    }
                    if reply.code == ReplyCode::FrameReceiptError {
                        return Ok(Outcome::Retransmit("controller reported a damaged frame"));
                    }
                    return Ok(Outcome::Reply(reply));
                }
                Ok(None) => {}
                Err(ProtocolError::CrcMismatch { .. }) => {
                    return Ok(Outcome::Retransmit("reply failed CRC check"));
                }
                Err(e) if e.is_framing() => {
                    warn!("Protocol error on link: {}", e);
                    self.resync = true;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let n = self.stream.read(&mut self.buf).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }
}

/// A link to one controller.
///
/// Exactly one request is outstanding at a time.
pub struct Connection {
    id: Uuid,
    config: ConnectionConfig,
    link: Mutex<Link>,
    connected: AtomicBool,
}

impl Connection {
    /// Connects to a controller over TCP.
    pub async fn connect(addr: SocketAddr, config: ConnectionConfig) -> Result<Self, ClientError> {
        debug!("Connecting to {}...", addr);

        let tcp_stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        tcp_stream.set_nodelay(true).ok();

        let conn = Self::from_stream(tcp_stream, config);
        info!(connection = %conn.id, "Connected to {}", addr);
        Ok(conn)
    }

    /// Wraps an established transport.
    pub fn from_stream(stream: impl Into<ClientStream>, config: ConnectionConfig) -> Self {
        let buf = vec![0u8; config.read_buffer_size];
        let stream = stream.into();
        let id = Uuid::new_v4();
        debug!(connection = %id, transport = stream.kind(), "Link opened");
        Self {
            id,
            link: Mutex::new(Link {
                stream,
                decoder: Decoder::for_replies(),
                buf,
                sequence: 0,
                resync: true,
            }),
            config,
            connected: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Sends an order and waits for the matching reply.
    ///
    /// On timeout or a damaged frame the request is sent again with the same
    /// sequence so the controller can answer from its retry cache. Only the
    /// first transmission may carry the resync flag; a resync-flagged repeat
    /// would bypass the cache and execute the order twice.
    pub async fn request(&self, order: Order, params: &[u8]) -> Result<Reply, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let mut link = self.link.lock().await;
        let mut control = Control::new(link.sequence);
        if link.resync {
            control = control.with_resync();
            link.resync = false;
        }
        let mut encoded = Encoder::encode_request(control, order, params)?;

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            debug!(
                order = %order,
                sequence = control.sequence(),
                attempt = attempts,
                "Sending request ({} bytes)",
                encoded.len()
            );

            let result = link
                .exchange(&encoded, control.sequence(), self.config.request_timeout)
                .await;

            match result {
                Ok(Outcome::Reply(reply)) => {
                    if reply.control.is_event() {
                        debug!(order = %order, "Reply flags a new controller event");
                    }
                    link.sequence = (link.sequence + 1) % SEQUENCE_MODULUS;
                    return Ok(reply);
                }
                Ok(Outcome::Retransmit(reason)) => {
                    if attempts > self.config.max_retries {
                        warn!(order = %order, attempts, "Giving up on link: {}", reason);
                        self.connected.store(false, Ordering::SeqCst);
                        return Err(ClientError::Faulted { attempts });
                    }
                    warn!(order = %order, attempt = attempts, "Retransmitting: {}", reason);
                    if control.is_resync() {
                        control = Control::new(control.sequence());
                        encoded = Encoder::encode_request(control, order, params)?;
                    }
                }
                Err(e) => {
                    if e.is_disconnect() {
                        self.connected.store(false, Ordering::SeqCst);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Returns whether the connection is usable.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut link = self.link.lock().await;
        let _ = link.stream.shutdown().await;
        debug!(connection = %self.id, "Connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use pacer_core::Slot;
    use pacer_protocol::{FrameReceiptCode, QueueStatus, ResumeFlags};
    use tokio_test::io::Builder;

    fn request_bytes(control: Control, order: Order, params: &[u8]) -> Vec<u8> {
        Encoder::encode_request(control, order, params)
            .unwrap()
            .to_vec()
    }

    fn reply_bytes(sequence: u8, code: ReplyCode, params: &[u8]) -> Vec<u8> {
        Encoder::encode_reply(Control::new(sequence), code, params)
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new();
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(
            config.with_request_timeout(Duration::from_secs(1)).request_timeout,
            Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn test_first_request_sets_resync_then_sequence_advances() {
        let mock = Builder::new()
            .write(&request_bytes(
                Control::new(0).with_resync(),
                Order::RequestDeviceCount,
                &[4],
            ))
            .read(&reply_bytes(0, ReplyCode::Ok, &[3]))
            .write(&request_bytes(Control::new(1), Order::RequestDeviceCount, &[5]))
            .read(&reply_bytes(1, ReplyCode::Ok, &[1]))
            .build();

        let conn = Connection::from_stream(ClientStream::boxed(mock), ConnectionConfig::new());
        let reply = conn.request(Order::RequestDeviceCount, &[4]).await.unwrap();
        assert_eq!(&reply.params[..], &[3]);

        let reply = conn.request(Order::RequestDeviceCount, &[5]).await.unwrap();
        assert_eq!(&reply.params[..], &[1]);
    }

    #[tokio::test]
    async fn test_frame_receipt_error_retransmits_same_sequence() {
        let mock = Builder::new()
            .write(&request_bytes(Control::new(0).with_resync(), Order::SetOutput, &[0, 1]))
            .read(&reply_bytes(
                0,
                ReplyCode::FrameReceiptError,
                &[FrameReceiptCode::BadCrc as u8],
            ))
            .write(&request_bytes(Control::new(0), Order::SetOutput, &[0, 1]))
            .read(&reply_bytes(0, ReplyCode::Ok, &[]))
            .build();

        let conn = Connection::from_stream(ClientStream::boxed(mock), ConnectionConfig::new());
        let reply = conn.request(Order::SetOutput, &[0, 1]).await.unwrap();
        assert!(reply.is_ok());
    }

    #[tokio::test]
    async fn test_stale_reply_discarded() {
        let mut replies = reply_bytes(9, ReplyCode::Ok, &[0xEE]);
        replies.extend(reply_bytes(0, ReplyCode::Ok, &[0x01]));

        let mock = Builder::new()
            .write(&request_bytes(
                Control::new(0).with_resync(),
                Order::RequestInput,
                &[1, 0],
            ))
            .read(&replies)
            .build();

        let conn = Connection::from_stream(ClientStream::boxed(mock), ConnectionConfig::new());
        let reply = conn.request(Order::RequestInput, &[1, 0]).await.unwrap();
        assert_eq!(&reply.params[..], &[0x01]);
    }

    #[tokio::test]
    async fn test_faulted_after_max_retries() {
        let nack = reply_bytes(0, ReplyCode::FrameReceiptError, &[1]);
        let mock = Builder::new()
            .write(&request_bytes(Control::new(0).with_resync(), Order::Reset, &[]))
            .read(&nack)
            .write(&request_bytes(Control::new(0), Order::Reset, &[]))
            .read(&nack)
            .build();

        let conn = Connection::from_stream(
            ClientStream::boxed(mock),
            ConnectionConfig::new().with_max_retries(1),
        );
        let err = conn.request(Order::Reset, &[]).await.unwrap_err();
        assert!(matches!(err, ClientError::Faulted { attempts: 2 }));
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.request(Order::Reset, &[]).await,
            Err(ClientError::NotConnected)
        ));
    }

    /// What the relay does with one reply on its way to the host.
    #[derive(Clone, Copy)]
    enum Fate {
        Forward,
        StrayByteFirst,
        Drop,
    }

    /// Links a host stream to the simulator through a relay that applies
    /// `fates` to the replies in order, forwarding everything after them.
    fn relay(sim: &pacer_sim::Simulator, fates: Vec<Fate>) -> tokio::io::DuplexStream {
        let (host, relay_host) = tokio::io::duplex(4096);
        let (relay_sim, controller) = tokio::io::duplex(4096);
        tokio::spawn(sim.serve_stream(controller, "relay"));

        let (mut from_host, mut to_sim) = tokio::io::split(relay_host);
        let (mut from_sim, mut to_host) = tokio::io::split(relay_sim);
        tokio::spawn(async move { tokio::io::copy(&mut from_host, &mut to_sim).await });
        tokio::spawn(async move {
            let mut decoder = Decoder::for_replies();
            let mut fates = fates.into_iter();
            let mut buf = [0u8; 512];
            loop {
                let n = match from_sim.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                while let Ok(Some(frame)) = decoder.decode_frame() {
                    let bytes = frame.encode().unwrap();
                    match fates.next().unwrap_or(Fate::Forward) {
                        Fate::Forward => to_host.write_all(&bytes).await.unwrap(),
                        Fate::StrayByteFirst => {
                            to_host.write_all(&[0x00]).await.unwrap();
                            to_host.write_all(&bytes).await.unwrap();
                        }
                        Fate::Drop => {}
                    }
                }
            }
        });
        host
    }

    #[tokio::test]
    async fn test_retransmission_after_sync_loss_is_answered_from_cache() {
        let sim = pacer_sim::Simulator::start(pacer_sim::Config::default());
        let host = relay(&sim, vec![Fate::Forward, Fate::StrayByteFirst, Fate::Drop]);
        let conn = Connection::from_stream(
            host,
            ConnectionConfig::new().with_request_timeout(Duration::from_millis(200)),
        );

        conn.request(Order::Resume, &[ResumeFlags::clear().bits()])
            .await
            .unwrap();
        // The reply arrives behind a stray byte, so the next request carries resync.
        conn.request(Order::ActivateStepperControl, &[1])
            .await
            .unwrap();

        // Long delays keep the slots queued; the first reply is lost.
        let mut blocks = BytesMut::new();
        for _ in 0..2 {
            Slot::Delay { micros: 5_000_000 }.encode(&mut blocks).unwrap();
        }
        let reply = conn
            .request(Order::QueueCommandBlocks, &blocks)
            .await
            .unwrap();
        assert!(reply.is_ok());
        assert_eq!(sim.stats().replays_total.load(Ordering::Relaxed), 1);

        // The executor holds at most one slot; a second enqueue would leave three.
        let reply = conn.request(Order::QueueCommandBlocks, &[]).await.unwrap();
        let status = QueueStatus::decode(&reply.params).unwrap();
        assert!((1..=2).contains(&status.used), "used = {}", status.used);

        sim.shutdown();
    }

    #[tokio::test]
    async fn test_connection_closed() {
        let (host, controller) = tokio::io::duplex(64);
        drop(controller);

        let conn = Connection::from_stream(host, ConnectionConfig::new());
        let err = conn.request(Order::RequestInformation, &[0]).await.unwrap_err();
        assert!(err.is_disconnect());
        assert!(!conn.is_connected());
    }
}
