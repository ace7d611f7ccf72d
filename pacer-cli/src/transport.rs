//! Line transports for the dispatcher.

use crate::dispatcher::Dispatcher;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info};

/// Feeds lines from `reader` to the dispatcher and writes one response per line.
///
/// Returns when the reader reaches end of input.
pub async fn serve_lines<R, W>(
    dispatcher: &Mutex<Dispatcher>,
    reader: R,
    mut writer: W,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut handled = 0;

    while let Some(line) = lines.next_line().await? {
        let response = dispatcher.lock().await.handle_line(&line).await;
        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        handled += 1;
    }

    Ok(handled)
}

/// Runs the dispatcher over stdin and stdout.
pub async fn run_stdio(dispatcher: Dispatcher) -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = Mutex::new(dispatcher);
    let handled = serve_lines(&dispatcher, tokio::io::stdin(), tokio::io::stdout()).await?;
    debug!(lines = handled, "Input closed");

    dispatcher.lock().await.flush().await?;
    Ok(())
}

/// TCP line server sharing one dispatcher between connections.
///
/// Requests from different connections are serialized.
pub struct LineServer {
    dispatcher: Arc<Mutex<Dispatcher>>,
    shutdown: broadcast::Sender<()>,
}

impl LineServer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            dispatcher: Arc::new(Mutex::new(dispatcher)),
            shutdown,
        }
    }

    /// Accepts connections until shut down.
    pub async fn run(&self, listen: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(listen).await?;
        info!("G-code server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            info!("New connection from {}", addr);
                            let dispatcher = self.dispatcher.clone();
                            tokio::spawn(async move {
                                let (reader, writer) = stream.into_split();
                                match serve_lines(&dispatcher, reader, writer).await {
                                    Ok(lines) => info!("Connection {} closed after {} lines", addr, lines),
                                    Err(e) => error!("Connection {} error: {}", addr, e),
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("G-code server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}
