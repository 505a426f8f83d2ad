//! # Dispatcher with Message Pump
//!
//! The primary's side of the protocol. The dispatcher builds stand-ins,
//! keeps the callback registry and the worker table, and runs a pump that
//! reads every frame the workers send back and routes it to the callbacks
//! registered for its invocation.
//!
//! ## Invocation lifecycle
//!
//! ```text
//! register_callbacks ──> id stamped on stand-in ──> call ──> Invoke
//!                                                            │
//!                       Event* ──> event callbacks           │
//!                       Result ──> success callback  <───────┘
//!                       Error  ──> error callback
//! ```
//!
//! ## Concurrency
//!
//! Outgoing frames go through a single writer task, so they leave in the
//! order they were queued. Incoming frames are handled one at a time by the
//! pump; callbacks never run concurrently with each other.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use offrpc::Codec;
use offrpc::ContextId;
use offrpc::Envelope;
use offrpc::InvocationId;
use offrpc::Message;
use offrpc::TypeName;
use offrpc::WorkerId;
use offrpc::message::ErrorMessage;
use offrpc::message::EventMessage;
use offrpc::message::InvokeMessage;
use offrpc::message::ResultMessage;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::contract::Catalog;
use crate::contract::Contract;
use crate::contract::TypeRef;
use crate::error::Error;
use crate::error::Result;
use crate::registry::EventHandler;
use crate::registry::Registry;
use crate::settings::Settings;
use crate::standin::StandIn;
use crate::transport;
use crate::transport::Transport;
use crate::workers::CreateStatus;
use crate::workers::ReadyStatus;
use crate::workers::WorkerState;
use crate::workers::WorkerTable;

/// What to do when an outgoing frame cannot be delivered.
#[derive(Clone, Copy, Debug)]
enum OnUndeliverable {
    Log,
    FailInvocation(InvocationId),
    ForgetWorker(WorkerId),
}

struct Outgoing {
    target: ContextId,
    payload: Vec<u8>,
    command: &'static str,
    on_undeliverable: OnUndeliverable,
}

struct Shared {
    codec: Codec,
    settings: Arc<Settings>,
    catalog: Catalog,
    registry: Registry,
    workers: WorkerTable,
    transport: Arc<dyn Transport>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    next_invocation: AtomicU64,
}

/// Fluent configuration for a [`Dispatcher`].
pub struct DispatcherBuilder {
    transport: Arc<dyn Transport>,
    settings: Option<Arc<Settings>>,
    codec: Codec,
}

impl DispatcherBuilder {
    pub fn new(transport: impl Transport) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            settings: None,
            codec: Codec::new(),
        }
    }

    pub fn settings(mut self, settings: Arc<Settings>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Builds the dispatcher and starts its writer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Dispatcher> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let (outbox, queue) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            codec: self.codec,
            settings: self.settings.unwrap_or_default(),
            catalog: Catalog::default(),
            registry: Registry::default(),
            workers: WorkerTable::default(),
            transport: self.transport,
            outbox,
            next_invocation: AtomicU64::new(1),
        });

        runtime.spawn(Dispatcher::write_loop(Arc::downgrade(&shared), shared.transport.clone(), queue));
        Ok(Dispatcher { shared })
    }
}

/// The primary's handle on the invocation runtime. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn builder(transport: impl Transport) -> DispatcherBuilder {
        DispatcherBuilder::new(transport)
    }

    pub fn codec(&self) -> &Codec {
        &self.shared.codec
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.shared.settings
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub(crate) fn next_invocation(&self) -> InvocationId {
        InvocationId(self.shared.next_invocation.fetch_add(1, Ordering::Relaxed))
    }

    /// Invocations with an entry in the registry.
    pub fn pending_invocations(&self) -> usize {
        self.shared.registry.len()
    }

    /// Invocations sent to a worker and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.shared.registry.in_flight()
    }

    pub fn worker_state(&self, worker: WorkerId) -> Option<WorkerState> {
        self.shared.workers.state(worker)
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        self.shared.workers.ids()
    }

    // ------------------------------------------------------------------
    //  Workers
    // ------------------------------------------------------------------

    /// Asks for a worker to be created. A random id is chosen when none is
    /// given. The worker receives every setting and the current credential.
    pub fn create_worker(&self, worker: Option<WorkerId>) -> Result<(WorkerId, CreateStatus)> {
        self.start_worker(worker, None)
    }

    /// Like [`create_worker`](Self::create_worker), running `on_ready` once
    /// the worker reports ready.
    pub fn create_worker_with<F>(&self, worker: Option<WorkerId>, on_ready: F) -> Result<(WorkerId, CreateStatus)>
    where
        F: FnOnce(WorkerId) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.start_worker(worker, Some(Box::new(on_ready)))
    }

    fn start_worker(
        &self,
        worker: Option<WorkerId>,
        on_ready: Option<crate::workers::ReadyCallback>,
    ) -> Result<(WorkerId, CreateStatus)> {
        let worker = worker.unwrap_or_else(|| WorkerId(rand::random()));
        let status = self.shared.workers.begin(worker, on_ready);
        match status {
            CreateStatus::Initializing => {
                info!(%worker, "creating worker");
                let message = Message::Create {
                    worker,
                    settings: self.shared.settings.all(),
                    credential: self.shared.settings.credential(),
                };
                if let Err(e) = self.enqueue(worker.into(), &message, OnUndeliverable::ForgetWorker(worker)) {
                    self.shared.workers.remove(worker);
                    return Err(e);
                }
            }
            CreateStatus::AlreadyExists => info!(%worker, "worker already created"),
            CreateStatus::AlreadyInitializing => warn!(%worker, "worker is still initializing"),
        }
        Ok((worker, status))
    }

    /// Runs `callback` when `worker` is ready, or right away if it already is.
    pub fn register_ready_callback<F>(&self, worker: WorkerId, callback: F) -> ReadyStatus
    where
        F: FnOnce(WorkerId) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let (status, run_now) = self.shared.workers.add_ready_callback(worker, Box::new(callback));
        match status {
            ReadyStatus::Registered => debug!(%worker, "ready callback queued"),
            ReadyStatus::Executed => info!(%worker, "worker already ready, running callback now"),
            ReadyStatus::NotFound => warn!(%worker, "cannot register ready callback: worker not found"),
        }
        if let Some(callback) = run_now {
            if let Err(e) = callback(worker) {
                error!(%worker, error = %e, "ready callback failed");
            }
        }
        status
    }

    /// Tears a worker down. Everything still registered against it is
    /// dropped; its callbacks never fire and its pending values resolve as
    /// abandoned.
    pub fn terminate_worker(&self, worker: WorkerId) -> Result<()> {
        info!(%worker, "terminating worker");
        let sent = self.enqueue(worker.into(), &Message::Terminate { worker }, OnUndeliverable::Log);
        self.shared.workers.remove(worker);
        let pruned = self.shared.registry.prune_worker(worker);
        if pruned > 0 {
            debug!(%worker, pruned, "pruned registrations of terminated worker");
        }
        sent
    }

    /// Pushes the current credential to `worker`. Returns false when no
    /// credential is held.
    pub fn send_credential(&self, worker: WorkerId) -> Result<bool> {
        let Some(credential) = self.shared.settings.credential() else {
            warn!(%worker, "cannot send a missing credential");
            return Ok(false);
        };
        self.enqueue(worker.into(), &Message::Credential { credential }, OnUndeliverable::Log)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    //  Stand-ins and registration
    // ------------------------------------------------------------------

    /// Builds a stand-in for contract `C` bound to `worker`.
    pub fn proxy<C: Contract>(&self, worker: WorkerId, upload_context: Option<&str>) -> Result<C> {
        let descriptor = self.shared.catalog.descriptor::<C>()?;
        let table = self.shared.catalog.table::<C>(&descriptor);
        let stand_in = StandIn::new(
            descriptor,
            table,
            worker,
            upload_context.map(str::to_string),
            self.clone(),
        );
        Ok(C::bind(stand_in))
    }

    /// Registers callbacks for the next call `stand_in` makes to `method`
    /// and returns the invocation id that call will carry.
    ///
    /// Methods without a value accept any `R`. A method with a concrete value
    /// type must return exactly `R`; a generic one is checked once the call
    /// supplies its witnesses.
    pub fn register_callbacks<R, S, E>(
        &self,
        stand_in: &StandIn,
        method: &str,
        on_success: S,
        on_error: E,
    ) -> Result<InvocationId>
    where
        R: DeserializeOwned + 'static,
        S: FnOnce(R) -> anyhow::Result<()> + Send + Sync + 'static,
        E: FnOnce(&Error) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let declared = stand_in.descriptor().method(method)?;
        let expected = TypeName::of::<R>();
        let deferred_check = match declared.returns.value_type() {
            None => None,
            Some(TypeRef::Generic(_)) => Some(expected.clone()),
            Some(TypeRef::Concrete(declared_type)) if *declared_type == expected => None,
            Some(TypeRef::Concrete(declared_type)) => {
                return Err(Error::ReturnTypeMismatch {
                    method: method.to_string(),
                    declared: declared_type.clone(),
                    expected,
                });
            }
        };

        let id = self.next_invocation();
        self.shared.registry.register(
            id,
            stand_in.worker(),
            stand_in.contract().clone(),
            method,
            deferred_check,
            Box::new(move |codec: &Codec, raw: &str| on_success(codec.decode::<R>(raw)?)),
            Box::new(on_error),
        );
        self.stamp(stand_in, id);
        debug!(invocation = %id, contract = %stand_in.contract(), method, "registered callbacks");
        Ok(id)
    }

    /// Registers callbacks for a call whose value, if any, is ignored.
    pub fn register_void_callbacks<S, E>(
        &self,
        stand_in: &StandIn,
        method: &str,
        on_success: S,
        on_error: E,
    ) -> Result<InvocationId>
    where
        S: FnOnce() -> anyhow::Result<()> + Send + Sync + 'static,
        E: FnOnce(&Error) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        stand_in.descriptor().method(method)?;
        let id = self.next_invocation();
        self.shared.registry.register(
            id,
            stand_in.worker(),
            stand_in.contract().clone(),
            method,
            None,
            Box::new(move |_: &Codec, _: &str| on_success()),
            Box::new(on_error),
        );
        self.stamp(stand_in, id);
        debug!(invocation = %id, contract = %stand_in.contract(), method, "registered void callbacks");
        Ok(id)
    }

    /// Stamps `id` on `stand_in`. A registration it supersedes was never
    /// sent, so no terminal message will name it; its callbacks are dropped.
    fn stamp(&self, stand_in: &StandIn, id: InvocationId) {
        if let Some(previous) = stand_in.stamp(id) {
            if self.shared.registry.take(previous).is_some() {
                debug!(invocation = %previous, superseded_by = %id, "dropped superseded registration");
            }
        }
    }

    /// Listens to `event` during invocation `id`, which must be the one
    /// most recently registered on `stand_in`. The stand-in's next call
    /// asks the worker to raise the event.
    pub fn register_event_callback<A, F>(
        &self,
        stand_in: &StandIn,
        id: InvocationId,
        event: &str,
        handler: F,
    ) -> Result<()>
    where
        A: DeserializeOwned + 'static,
        F: Fn(A) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let declared = stand_in.descriptor().event(event)?;
        let expected = TypeName::of::<A>();
        if declared.arg_type != expected {
            return Err(Error::EventTypeMismatch {
                event: event.to_string(),
                declared: declared.arg_type.clone(),
                expected,
            });
        }
        self.attach_event(stand_in, id, event, Arc::new(move |codec: &Codec, raw: &str| handler(codec.decode::<A>(raw)?)))
    }

    /// Listens to `event` during invocation `id`, ignoring its argument.
    pub fn register_void_event_callback<F>(
        &self,
        stand_in: &StandIn,
        id: InvocationId,
        event: &str,
        handler: F,
    ) -> Result<()>
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        stand_in.descriptor().event(event)?;
        self.attach_event(stand_in, id, event, Arc::new(move |_: &Codec, _: &str| handler()))
    }

    fn attach_event(&self, stand_in: &StandIn, id: InvocationId, event: &str, handler: EventHandler) -> Result<()> {
        let expected = stand_in.pending_invocation();
        if expected != Some(id) || !self.shared.registry.add_event(id, event, handler) {
            return Err(Error::InvocationMismatch { expected, received: id });
        }
        stand_in.add_event(event)?;
        debug!(invocation = %id, event, "registered event callback");
        Ok(())
    }

    // ------------------------------------------------------------------
    //  Outgoing
    // ------------------------------------------------------------------

    /// Sends an envelope built by `stand_in` as invocation `id`.
    pub(crate) fn dispatch(&self, stand_in: &StandIn, id: InvocationId, envelope: Envelope) -> Result<()> {
        let worker = stand_in.worker();
        if self.shared.workers.state(worker).is_none() {
            return Err(Error::WorkerNotFound(worker));
        }
        self.shared.registry.mark_dispatched(id, &envelope.method)?;

        let message = Message::Invoke(InvokeMessage {
            invocation: id,
            worker,
            envelope,
            events: stand_in.events(),
            upload_context: stand_in.upload_context().map(str::to_string),
        });
        self.enqueue(worker.into(), &message, OnUndeliverable::FailInvocation(id))
    }

    /// Fails invocation `id` locally, before or instead of any reply.
    pub(crate) fn fail(&self, id: InvocationId, error: Error) {
        match self.shared.registry.take(id) {
            Some(entry) => entry.fail(id, error),
            None => error!(invocation = %id, %error, "call failed with nobody registered to hear it"),
        }
    }

    fn enqueue(&self, target: ContextId, message: &Message, on_undeliverable: OnUndeliverable) -> Result<()> {
        let payload = message.encode()?;
        self.shared
            .outbox
            .send(Outgoing {
                target,
                payload,
                command: message.command(),
                on_undeliverable,
            })
            .map_err(|_| Error::Transport(transport::Error::ConnectionLost("writer stopped".into())))
    }

    async fn write_loop(
        shared: Weak<Shared>,
        transport: Arc<dyn Transport>,
        mut queue: mpsc::UnboundedReceiver<Outgoing>,
    ) {
        while let Some(outgoing) = queue.recv().await {
            let Err(e) = transport.send(outgoing.target, &outgoing.payload).await else {
                continue;
            };
            error!(target_context = %outgoing.target, command = outgoing.command, error = %e, "frame could not be delivered");

            let Some(shared) = shared.upgrade() else { break };
            let dispatcher = Dispatcher { shared };
            match outgoing.on_undeliverable {
                OnUndeliverable::Log => {}
                OnUndeliverable::FailInvocation(id) => dispatcher.fail(id, Error::Transport(e)),
                OnUndeliverable::ForgetWorker(worker) => {
                    dispatcher.shared.workers.remove(worker);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    //  Incoming
    // ------------------------------------------------------------------

    /// Runs the pump until the transport closes or a fatal error arrives.
    /// Everything still pending is then abandoned.
    ///
    /// Returns the error that stopped the pump.
    pub async fn serve(&self) -> Error {
        let error = loop {
            match self.shared.transport.recv().await {
                Ok(Some(frame)) => {
                    if let Err(e) = self.handle_frame(&frame) {
                        if e.is_fatal() {
                            error!(error = %e, "fatal error in pump");
                            break e;
                        }
                        warn!(error = %e, "error handling frame");
                    }
                }
                Ok(None) => {
                    break Error::Transport(transport::Error::ConnectionLost("stream closed".into()));
                }
                Err(e) => {
                    error!(error = %e, "transport error in pump");
                    break Error::Transport(e);
                }
            }
        };

        let abandoned = self.shared.registry.abandon_all();
        if abandoned > 0 {
            warn!(abandoned, "pump stopped with invocations outstanding");
        }
        error
    }

    /// Spawns [`serve`](Self::serve) on the current runtime.
    pub fn spawn_pump(&self) -> JoinHandle<Error> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.serve().await })
    }

    pub fn handle_frame(&self, frame: &[u8]) -> Result<()> {
        let message = Message::decode(frame)?;
        self.handle(message)
    }

    /// Routes one message from a worker.
    pub fn handle(&self, message: Message) -> Result<()> {
        trace!(command = message.command(), invocation = ?message.invocation(), "routing message");
        match message {
            Message::WorkerReady { worker } => self.on_worker_ready(worker),
            Message::Result(result) => self.on_result(result),
            Message::Error(error) => self.on_error(error),
            Message::Event(event) => self.on_event(event),
            Message::CredentialRefreshRequest { worker } => self.on_refresh_request(worker),
            other => {
                warn!(command = other.command(), "unexpected message on primary; dropping");
                Ok(())
            }
        }
    }

    /// Promotes `worker` to ready and runs its queued callbacks.
    pub fn on_worker_ready(&self, worker: WorkerId) -> Result<()> {
        let callbacks = self.shared.workers.promote(worker)?;
        info!(%worker, callbacks = callbacks.len(), "worker ready");
        for callback in callbacks {
            if let Err(e) = callback(worker) {
                error!(%worker, error = %e, "ready callback failed");
            }
        }
        Ok(())
    }

    pub fn on_result(&self, message: ResultMessage) -> Result<()> {
        let id = message.invocation;
        let Some(entry) = self.shared.registry.take(id) else {
            debug!(invocation = %id, method = %message.envelope.method, "result with nothing pending; dropping");
            return Ok(());
        };
        if entry.method != message.envelope.method {
            warn!(invocation = %id, expected = %entry.method, received = %message.envelope.method, "result names another method");
        }
        debug!(invocation = %id, worker = %entry.worker, method = %entry.method, "result");
        entry.succeed(id, &self.shared.codec, message.value);
        Ok(())
    }

    pub fn on_event(&self, message: EventMessage) -> Result<()> {
        let id = message.invocation;
        let Some(handler) = self.shared.registry.event_handler(id, &message.event) else {
            warn!(invocation = %id, event = %message.event, "no listener for event; dropping");
            return Ok(());
        };
        if let Err(e) = handler(&self.shared.codec, &message.value) {
            error!(invocation = %id, event = %message.event, error = %e, "event callback failed");
        }
        Ok(())
    }

    /// Routes an error to its invocation. An error with no invocation
    /// context is a worker-level fault and is returned as fatal.
    pub fn on_error(&self, message: ErrorMessage) -> Result<()> {
        let Some((id, envelope)) = message.call_scope() else {
            error!(worker = ?message.worker, error = %message.error, "worker fault");
            return Err(Error::WorkerFault {
                worker: message.worker,
                error: message.error,
            });
        };
        let Some(entry) = self.shared.registry.take(id) else {
            warn!(invocation = %id, method = %envelope.method, error = %message.error, "error with nothing pending; dropping");
            return Ok(());
        };
        warn!(invocation = %id, worker = %entry.worker, envelope = %envelope, error = %message.error, "invocation failed");
        entry.fail(id, Error::Remote(message.error));
        Ok(())
    }

    fn on_refresh_request(&self, worker: WorkerId) -> Result<()> {
        match self.shared.settings.credential() {
            Some(credential) => {
                info!(%worker, "answering credential refresh");
                let message = Message::CredentialRefreshResponse { secret: credential.secret };
                self.enqueue(worker.into(), &message, OnUndeliverable::Log)
            }
            None => {
                warn!(%worker, "credential refresh requested but none is held");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.shared.workers.ids())
            .field("pending", &self.shared.registry.len())
            .finish()
    }
}
