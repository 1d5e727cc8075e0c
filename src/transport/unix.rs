//! Unix domain socket transport.
//!
//! Provides:
//! - A framed stream endpoint implementing the message protocol
//! - A listener that turns accepted sockets into connection events

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{IpcError, Result};
use crate::event::{Emitter, EmitterOptions, Event, lock};
use crate::ipc::messages::{Message, MessageKind};
use crate::ipc::protocol::MessagePassingProtocol;
use crate::ipc::router::ClientConnection;
use crate::transport::codec::{DEFAULT_MAX_FRAME_BYTES, NdJsonCodec};

/// Socket location and limits.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Path to the Unix socket
    pub socket_path: PathBuf,
    /// Maximum number of concurrent clients
    pub max_clients: usize,
    /// Largest accepted frame in bytes
    pub max_frame_bytes: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            socket_path: std::env::temp_dir().join("chanipc.sock"),
            max_clients: 16,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl SocketOptions {
    pub fn with_socket_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.socket_path = path.as_ref().to_path_buf();
        self
    }

    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }
}

/// A connected socket speaking newline-delimited JSON messages.
///
/// Dropping the last handle stops the reader and fires `on_close`.
pub struct UnixProtocol {
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: Arc<Emitter<Message>>,
    closed: Arc<Emitter<()>>,
    shutdown: CancellationToken,
}

impl UnixProtocol {
    /// Connect to a listening socket.
    pub async fn connect<P: AsRef<Path>>(path: P, max_frame_bytes: usize) -> Result<Arc<Self>> {
        let stream = UnixStream::connect(path.as_ref()).await.map_err(|e| {
            IpcError::Transport(format!("Failed to connect to {}: {}", path.as_ref().display(), e))
        })?;
        Ok(Self::from_stream(stream, max_frame_bytes))
    }

    /// Wrap an established stream. Spawns its reader and writer tasks.
    pub fn from_stream(stream: UnixStream, max_frame_bytes: usize) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        let mut frames = FramedRead::new(reader, NdJsonCodec::<Message>::with_max_length(max_frame_bytes));
        let sink = FramedWrite::new(writer, NdJsonCodec::<Message>::with_max_length(max_frame_bytes));
        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(write_frames(sink, rx));

        // Reading starts once someone listens, so early frames are not lost.
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let ready_tx = Mutex::new(Some(ready_tx));
        let inbound = Arc::new(Emitter::with_options(EmitterOptions::default().on_first_listener_add(
            move || {
                if let Some(tx) = lock(&ready_tx).take() {
                    let _ = tx.send(());
                }
            },
        )));
        let closed = Arc::new(Emitter::new());
        let shutdown = CancellationToken::new();

        let reader_inbound = Arc::clone(&inbound);
        let reader_closed = Arc::clone(&closed);
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let started = tokio::select! {
                biased;
                _ = reader_shutdown.cancelled() => false,
                ready = ready_rx => ready.is_ok(),
            };
            if started {
                loop {
                    let frame = tokio::select! {
                        biased;
                        _ = reader_shutdown.cancelled() => break,
                        frame = frames.next() => frame,
                    };
                    match frame {
                        Some(Ok(message)) => reader_inbound.fire(message),
                        Some(Err(e)) => {
                            warn!("Socket read failed: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
            }
            debug!("Socket reader finished");
            reader_closed.fire(());
        });

        Arc::new(Self {
            outbound: Mutex::new(Some(tx)),
            inbound,
            closed,
            shutdown,
        })
    }

    /// Stop writing; the write half is shut down once queued frames are flushed.
    pub fn close(&self) {
        lock(&self.outbound).take();
    }

    /// Fires when the peer hangs up or the stream fails.
    pub fn on_close(&self) -> Event<()> {
        self.closed.event()
    }
}

/// Drain queued messages onto the socket until the sender side goes away.
///
/// A message too large to encode is dropped. If it was the final response to
/// a call, an error response takes its place so the caller is not left
/// waiting.
async fn write_frames(
    mut sink: FramedWrite<OwnedWriteHalf, NdJsonCodec<Message>>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let terminal = match message.kind() {
            MessageKind::ResponseSuccess | MessageKind::ResponseError | MessageKind::ResponseErrorObj => message.id(),
            _ => None,
        };
        match sink.send(message).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!("Dropping unencodable frame: {}", e);
                let Some(id) = terminal else {
                    continue;
                };
                if let Err(e) = sink.send(Message::failure(id, &IpcError::Transport(e.to_string()))).await {
                    warn!("Socket write failed: {}", e);
                    break;
                }
            }
            Err(e) => {
                warn!("Socket write failed: {}", e);
                break;
            }
        }
    }
}

impl Drop for UnixProtocol {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl MessagePassingProtocol for UnixProtocol {
    fn send(&self, message: Message) -> Result<()> {
        let outbound = lock(&self.outbound);
        let Some(tx) = outbound.as_ref() else {
            return Err(IpcError::Transport("socket closed".into()));
        };
        tx.send(message)
            .map_err(|_| IpcError::Transport("socket writer stopped".into()))
    }

    fn on_message(&self) -> Event<Message> {
        self.inbound.event()
    }
}

/// Accepts socket connections and publishes them as connection events.
pub struct SocketListener {
    options: SocketOptions,
    listener: UnixListener,
    connections: Emitter<ClientConnection>,
    active: Arc<AtomicUsize>,
}

impl SocketListener {
    /// Bind the socket, replacing a stale one and creating its directory.
    /// Must be called inside a tokio runtime.
    pub fn bind(options: SocketOptions) -> Result<Self> {
        if options.socket_path.exists() {
            std::fs::remove_file(&options.socket_path)?;
        }
        if let Some(parent) = options.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&options.socket_path)
            .map_err(|e| IpcError::Transport(format!("Failed to bind socket: {}", e)))?;
        info!("Listening on {}", options.socket_path.display());

        Ok(Self {
            options,
            listener,
            connections: Emitter::new(),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.options.socket_path
    }

    pub fn on_connection(&self) -> Event<ClientConnection> {
        self.connections.event()
    }

    /// Number of open connections.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept connections until `shutdown` completes.
    pub async fn run<F: Future<Output = ()>>(&self, shutdown: F) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.accept(stream),
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = &mut shutdown => break,
            }
        }
        info!("Listener on {} shutting down", self.options.socket_path.display());
        Ok(())
    }

    fn accept(&self, stream: UnixStream) {
        if self.active.load(Ordering::SeqCst) >= self.options.max_clients {
            warn!("Rejecting connection: {} clients already connected", self.options.max_clients);
            return;
        }
        self.active.fetch_add(1, Ordering::SeqCst);

        let protocol = UnixProtocol::from_stream(stream, self.options.max_frame_bytes);
        let active = Arc::clone(&self.active);
        protocol.on_close().listen(move |_| {
            active.fetch_sub(1, Ordering::SeqCst);
        });

        debug!("Accepted connection ({} active)", self.active_count());
        self.connections.fire(ClientConnection {
            on_disconnect: protocol.on_close(),
            protocol,
        });
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.options.socket_path);
    }
}
