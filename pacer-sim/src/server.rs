//! Simulated controller server.

use crate::config::Config;
use crate::error::SimError;
use crate::executor::{SlotExecutor, ThermalModel};
use crate::handler::OrderHandler;
use crate::session::ConnectionState;
use pacer_protocol::{Control, Decoder, FrameReceiptCode, ProtocolError};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Read buffer size for link reads.
const READ_BUFFER_SIZE: usize = 1024;

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub replays_total: AtomicU64,
    pub frame_errors_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// A simulated controller reachable over TCP or any byte stream.
pub struct Simulator {
    config: Config,
    handler: Arc<OrderHandler>,
    executor: Arc<SlotExecutor>,
    thermal: Arc<ThermalModel>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Simulator {
    /// Creates the simulator and spawns its executor and thermal tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: Config) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let handler = Arc::new(OrderHandler::new(config.clone()));
        let executor = Arc::new(SlotExecutor::new(handler.clone()));
        let thermal = Arc::new(ThermalModel::new(handler.clone()));

        {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run().await });
        }
        {
            let thermal = thermal.clone();
            tokio::spawn(async move { thermal.run().await });
        }

        Self {
            config,
            handler,
            executor,
            thermal,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Accepts TCP links until shut down.
    pub async fn run(&self) -> Result<(), SimError> {
        let bind_addr = self.config.network.bind_addr;
        let listener = TcpListener::bind(bind_addr).await?;
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            "Simulator '{}' listening on {}",
            self.config.firmware.name,
            bind_addr
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.network.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            tcp_stream.set_nodelay(true).ok();

                            let stats = self.stats.clone();
                            let link = self.serve_stream(tcp_stream, addr.to_string());
                            tokio::spawn(async move {
                                if let Err(e) = link.await {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Simulator shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Serves one link over an arbitrary byte stream.
    ///
    /// The returned future owns everything it needs, so it can be spawned.
    pub fn serve_stream<S>(
        &self,
        stream: S,
        peer: impl Into<String>,
    ) -> impl Future<Output = Result<(), SimError>> + Send + 'static
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = self.handler.clone();
        let stats = self.stats.clone();
        let mut shutdown = self.shutdown.subscribe();
        let peer = peer.into();

        stats.connections_total.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);

        async move {
            let result =
                Self::handle_connection(stream, &peer, handler, stats.clone(), &mut shutdown).await;
            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            tracing::info!("Host disconnected: {}", peer);
            result
        }
    }

    /// Handles a single link.
    async fn handle_connection<S>(
        mut stream: S,
        peer: &str,
        handler: Arc<OrderHandler>,
        stats: Arc<ServerStats>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), SimError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::info!("Host connected: {}", peer);
        handler.boot();

        let mut state = ConnectionState::new(peer);
        let mut decoder = Decoder::for_requests();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = tokio::select! {
                result = stream.read(&mut buf) => result?,
                _ = shutdown.recv() => return Ok(()),
            };
            if n == 0 {
                tracing::debug!(
                    session = %state.id,
                    requests = state.request_count(),
                    replays = state.replay_count(),
                    age_ms = state.age().as_millis() as u64,
                    "Link closed by host"
                );
                return Ok(());
            }
            decoder.extend(&buf[..n]);

            loop {
                let reply = match decoder.decode_frame() {
                    Ok(Some(frame)) => {
                        stats.requests_total.fetch_add(1, Ordering::Relaxed);
                        let replays = state.replay_count();
                        let reply = state.respond(&handler, &frame)?;
                        if state.replay_count() > replays {
                            stats.replays_total.fetch_add(1, Ordering::Relaxed);
                        }
                        reply
                    }
                    Ok(None) => break,
                    Err(ProtocolError::CrcMismatch { control, .. }) => {
                        tracing::warn!("[{}] Damaged frame: CRC mismatch", peer);
                        stats.frame_errors_total.fetch_add(1, Ordering::Relaxed);
                        state.frame_receipt_error(control, FrameReceiptCode::BadCrc)?
                    }
                    Err(ProtocolError::InvalidLength(length)) => {
                        // The control byte sits past the bad length, so answer
                        // for the sequence the host is expected to send next.
                        tracing::warn!("[{}] Damaged frame: length {}", peer, length);
                        stats.frame_errors_total.fetch_add(1, Ordering::Relaxed);
                        let control = state.last_control().map_or(Control::new(0), |c| c.next());
                        state.frame_receipt_error(control.bits(), FrameReceiptCode::BadLength)?
                    }
                    Err(e) if e.is_framing() => {
                        tracing::warn!("[{}] Protocol error: {}", peer, e);
                        stats.frame_errors_total.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                stream.write_all(&reply).await?;
            }
            stream.flush().await?;
        }
    }

    /// Signals the simulator and every link to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.executor.shutdown();
        self.thermal.shutdown();
    }

    /// Returns whether the TCP listener is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.config.network.bind_addr
    }

    pub fn handler(&self) -> &Arc<OrderHandler> {
        &self.handler
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}
