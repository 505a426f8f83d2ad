//! # Transport Abstraction
//!
//! A minimal, async interface for moving whole frames between contexts.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: the transport knows nothing about messages or
//!   envelopes. It moves opaque buffers to an addressed context.
//! - **Fire and Forget**: `send` returns once the frame is handed off. Any
//!   answer arrives later through `recv`, or never.
//! - **Whole Frames**: each `send` arrives exactly once and in one piece.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use offrpc::ContextId;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

/// Errors that occur while moving frames.
#[derive(Debug, Clone)]
pub enum Error {
    /// The other end hung up.
    ConnectionLost(String),
    /// Nothing is attached at the addressed context.
    UnknownTarget(ContextId),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::UnknownTarget(target) => write!(f, "No context attached at {}", target),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Moves frames between this context and the others.
///
/// This trait is object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hands a frame to `target`.
    ///
    /// # invariants
    /// - Must not interpret the payload.
    /// - Must not wait for any reply.
    async fn send(&self, target: ContextId, payload: &[u8]) -> Result<()>;

    /// Receives the next frame addressed to this context.
    ///
    /// Returns `Ok(None)` once no sender can reach this context anymore.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;
}

/// An in-memory hub connecting one primary and any number of workers.
///
/// Every attached context gets an [`Endpoint`]. Frames sent to a context
/// land in that endpoint's queue.
#[derive(Clone, Default)]
pub struct Switchboard {
    routes: Arc<DashMap<ContextId, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Switchboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a context, replacing any endpoint already at that address.
    pub fn attach(&self, context: ContextId) -> Endpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(context, tx);
        Endpoint {
            context,
            routes: self.routes.clone(),
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Detaches a context. Its endpoint drains what is queued, then sees the
    /// end of the stream.
    pub fn detach(&self, context: ContextId) -> bool {
        self.routes.remove(&context).is_some()
    }

    pub fn is_attached(&self, context: ContextId) -> bool {
        self.routes.contains_key(&context)
    }
}

/// One context's connection to a [`Switchboard`].
pub struct Endpoint {
    context: ContextId,
    routes: Arc<DashMap<ContextId, mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl Endpoint {
    pub fn context(&self) -> ContextId {
        self.context
    }
}

#[async_trait::async_trait]
impl Transport for Endpoint {
    async fn send(&self, target: ContextId, payload: &[u8]) -> Result<()> {
        let tx = self
            .routes
            .get(&target)
            .map(|route| route.value().clone())
            .ok_or(Error::UnknownTarget(target))?;
        tx.send(payload.to_vec())
            .map_err(|_| Error::ConnectionLost(format!("{} is gone", target)))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use offrpc::WorkerId;

    use super::*;

    #[tokio::test]
    async fn frames_reach_the_addressed_context() {
        let board = Switchboard::new();
        let primary = board.attach(ContextId::Primary);
        let worker = board.attach(ContextId::Worker(WorkerId(1)));

        primary.send(worker.context(), b"ping").await.unwrap();
        worker.send(ContextId::Primary, b"pong").await.unwrap();

        assert_eq!(worker.recv().await.unwrap().unwrap(), b"ping");
        assert_eq!(primary.recv().await.unwrap().unwrap(), b"pong");
    }

    #[tokio::test]
    async fn unknown_targets_are_reported() {
        let board = Switchboard::new();
        let primary = board.attach(ContextId::Primary);
        let err = primary.send(ContextId::Worker(WorkerId(9)), b"x").await.unwrap_err();
        assert!(matches!(err, Error::UnknownTarget(ContextId::Worker(WorkerId(9)))));
    }

    #[tokio::test]
    async fn detached_endpoints_see_the_end_of_the_stream() {
        let board = Switchboard::new();
        let primary = board.attach(ContextId::Primary);
        let worker_id = ContextId::Worker(WorkerId(2));
        let worker = board.attach(worker_id);

        primary.send(worker_id, b"last").await.unwrap();
        assert!(board.detach(worker_id));
        assert!(!board.is_attached(worker_id));

        assert_eq!(worker.recv().await.unwrap().unwrap(), b"last");
        assert!(worker.recv().await.unwrap().is_none());
    }
}
