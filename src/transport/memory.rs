//! In-process transport: a linked pair of endpoints and a hub that hands out
//! connections to a multi-client server.

use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{IpcError, Result};
use crate::event::{Emitter, EmitterOptions, Event, lock};
use crate::ipc::messages::Message;
use crate::ipc::protocol::MessagePassingProtocol;
use crate::ipc::router::ClientConnection;

/// One end of an in-memory link.
///
/// Messages are delivered by a pump task, never synchronously from `send`.
/// Inbound messages are held until the first listener subscribes.
pub struct MemoryProtocol {
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: Arc<Emitter<Message>>,
    closed: Arc<Emitter<()>>,
    shutdown: CancellationToken,
}

impl MemoryProtocol {
    fn spawn(outbound: mpsc::UnboundedSender<Message>, mut rx: mpsc::UnboundedReceiver<Message>) -> Arc<Self> {
        let (ready_tx, mut ready_rx) = oneshot::channel::<()>();
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

        let pump_inbound = Arc::clone(&inbound);
        let pump_closed = Arc::clone(&closed);
        let pump_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            let mut waiting = true;
            loop {
                tokio::select! {
                    biased;
                    _ = pump_shutdown.cancelled() => break,
                    _ = &mut ready_rx, if waiting => {
                        waiting = false;
                        for message in held.drain(..) {
                            pump_inbound.fire(message);
                        }
                    }
                    message = rx.recv() => match message {
                        Some(message) if waiting => held.push(message),
                        Some(message) => pump_inbound.fire(message),
                        None => break,
                    },
                }
            }
            if !held.is_empty() {
                debug!("Memory link closed with {} undelivered message(s)", held.len());
            }
            debug!("Memory link closed");
            pump_closed.fire(());
        });

        Arc::new(Self {
            outbound: Mutex::new(Some(outbound)),
            inbound,
            closed,
            shutdown,
        })
    }

    /// Stop sending. The peer observes the close once queued messages drain.
    pub fn close(&self) {
        lock(&self.outbound).take();
    }

    /// Fires once the peer has closed or been dropped.
    pub fn on_close(&self) -> Event<()> {
        self.closed.event()
    }
}

impl Drop for MemoryProtocol {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl MessagePassingProtocol for MemoryProtocol {
    fn send(&self, message: Message) -> Result<()> {
        let outbound = lock(&self.outbound);
        let Some(tx) = outbound.as_ref() else {
            return Err(IpcError::Transport("memory link closed".into()));
        };
        tx.send(message)
            .map_err(|_| IpcError::Transport("memory peer dropped".into()))
    }

    fn on_message(&self) -> Event<Message> {
        self.inbound.event()
    }
}

/// Create two linked endpoints. Must be called inside a tokio runtime.
pub fn memory_pair() -> (Arc<MemoryProtocol>, Arc<MemoryProtocol>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (MemoryProtocol::spawn(b_tx, a_rx), MemoryProtocol::spawn(a_tx, b_rx))
}

/// Connection source for an in-process multi-client server.
#[derive(Default)]
pub struct MemoryHub {
    connections: Emitter<ClientConnection>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connection(&self) -> Event<ClientConnection> {
        self.connections.event()
    }

    /// Open a connection and return the client's end of it.
    pub fn connect(&self) -> Arc<MemoryProtocol> {
        let (client, server) = memory_pair();
        self.connections.fire(ClientConnection {
            on_disconnect: server.on_close(),
            protocol: server,
        });
        client
    }
}
