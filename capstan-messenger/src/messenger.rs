//! Request/response/update correlation over a connection

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::envelope::{Envelope, MessageKind};
use crate::error::{MessengerError, Result};

/// Handles messages arriving from the peer
///
/// A request handler error is converted into an error response sent back to
/// the peer; it never tears the connection down.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_request(&self, data: serde_json::Value) -> std::result::Result<serde_json::Value, String>;

    async fn handle_update(&self, data: serde_json::Value);
}

/// Handler for endpoints that only issue requests
pub struct NullHandler;

#[async_trait]
impl MessageHandler for NullHandler {
    async fn handle_request(
        &self,
        _data: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, String> {
        Err("no request handler installed".to_string())
    }

    async fn handle_update(&self, _data: serde_json::Value) {
        debug!("dropping update, no handler installed");
    }
}

struct Inner {
    connection: Arc<dyn Connection>,
    handler: Arc<dyn MessageHandler>,
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    outbound_rx: StdMutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    pending: StdMutex<HashMap<Uuid, oneshot::Sender<Result<serde_json::Value>>>>,
    cancel: CancellationToken,
}

/// The message-correlation layer
///
/// Cheap to clone; all clones share one connection. `run()` must be driven
/// (usually on its own task) for any exchange to make progress.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<Inner>,
}

impl Messenger {
    pub fn new(connection: Arc<dyn Connection>, handler: Arc<dyn MessageHandler>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                connection,
                handler,
                outbound_tx,
                outbound_rx: StdMutex::new(Some(outbound_rx)),
                pending: StdMutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Pumps the three message loops until the connection closes, a protocol
    /// error occurs, or the messenger is disposed
    ///
    /// Always disposes on exit, so every outstanding request resolves with
    /// [`MessengerError::Cancelled`] rather than hanging its caller.
    pub async fn run(&self) -> Result<()> {
        let mut outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| MessengerError::Protocol("messenger run() called twice".into()))?;

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();

        let result = tokio::select! {
            r = self.pump_inbound(inbound_tx) => r,
            r = self.dispatch_loop(&mut inbound_rx) => r,
            r = self.pump_outbound(&mut outbound_rx) => r,
            _ = self.inner.cancel.cancelled() => Ok(()),
        };

        self.dispose();
        self.inner.connection.close().await;
        result
    }

    /// Sends a request and waits for the correlated response
    ///
    /// Resolves with [`MessengerError::Remote`] if the peer answers with an
    /// error payload, and [`MessengerError::Cancelled`] if the messenger is
    /// disposed while the request is queued or outstanding.
    pub async fn send_request(&self, data: serde_json::Value) -> Result<serde_json::Value> {
        let envelope = Envelope::request(data);
        let id = envelope.id;
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().unwrap();
            if self.inner.cancel.is_cancelled() {
                return Err(MessengerError::Cancelled);
            }
            pending.insert(id, tx);
        }

        if self.inner.outbound_tx.send(envelope).is_err() {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(MessengerError::Cancelled);
        }

        rx.await.map_err(|_| MessengerError::Cancelled)?
    }

    /// Enqueues an update and returns immediately; no acknowledgement
    pub fn send_update(&self, data: serde_json::Value) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(MessengerError::Cancelled);
        }
        self.inner
            .outbound_tx
            .send(Envelope::update(data))
            .map_err(|_| MessengerError::Cancelled)
    }

    /// Cancels the pump loops and fails every pending exchange
    ///
    /// Idempotent; the messenger is permanently unusable afterwards.
    pub fn dispose(&self) {
        self.inner.cancel.cancel();
        let drained: Vec<_> = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "cancelling outstanding requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(MessengerError::Cancelled));
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Reads frames off the connection into the inbound queue
    async fn pump_inbound(&self, inbound_tx: mpsc::UnboundedSender<Envelope>) -> Result<()> {
        loop {
            let frame = match self.inner.connection.recv().await? {
                Some(frame) => frame,
                // Peer closed; not an error
                None => return Ok(()),
            };
            let envelope: Envelope = serde_json::from_slice(&frame).map_err(|e| {
                MessengerError::Protocol(format!("unparseable frame: {e}"))
            })?;
            if inbound_tx.send(envelope).is_err() {
                return Ok(());
            }
        }
    }

    /// Dispatches queued inbound messages to the handler or pending map
    async fn dispatch_loop(
        &self,
        inbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    ) -> Result<()> {
        while let Some(envelope) = inbound_rx.recv().await {
            match envelope.kind {
                MessageKind::Request => self.spawn_request_handler(envelope),
                MessageKind::Response => self.resolve_response(envelope),
                MessageKind::Update => {
                    let data = envelope.data.unwrap_or(serde_json::Value::Null);
                    self.inner.handler.handle_update(data).await;
                }
            }
        }
        Ok(())
    }

    /// Runs the handler on its own task so a slow request cannot stall
    /// response correlation
    fn spawn_request_handler(&self, envelope: Envelope) {
        let handler = Arc::clone(&self.inner.handler);
        let outbound = self.inner.outbound_tx.clone();
        let id = envelope.id;
        let data = envelope.data.unwrap_or(serde_json::Value::Null);

        tokio::spawn(async move {
            let reply = match handler.handle_request(data).await {
                Ok(value) => Envelope::response(id, value),
                Err(message) => Envelope::error_response(id, message),
            };
            let _ = outbound.send(reply);
        });
    }

    fn resolve_response(&self, envelope: Envelope) {
        let waiter = self.inner.pending.lock().unwrap().remove(&envelope.id);
        match waiter {
            Some(tx) => {
                let result = match envelope.error {
                    Some(message) => Err(MessengerError::Remote(message)),
                    None => Ok(envelope.data.unwrap_or(serde_json::Value::Null)),
                };
                let _ = tx.send(result);
            }
            None => warn!(id = %envelope.id, "response for unknown request"),
        }
    }

    /// Writes queued outbound frames to the connection in enqueue order
    async fn pump_outbound(
        &self,
        outbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    ) -> Result<()> {
        while let Some(envelope) = outbound_rx.recv().await {
            let frame = serde_json::to_vec(&envelope)?;
            self.inner.connection.send(&frame).await?;
        }
        Ok(())
    }
}
