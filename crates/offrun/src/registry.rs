//! # Callback Registry
//!
//! Per-invocation bookkeeping on the primary: who wants to hear about an
//! invocation's result, error, and events, and who is awaiting it.
//!
//! ## Invariants
//! - **Take on Terminal**: the first `Result` or `Error` for an invocation
//!   removes its entry. Anything arriving later finds nothing and is dropped,
//!   so at most one terminal message is ever processed per invocation.
//! - **Pruned**: entries leave the registry on their terminal message, or
//!   when their worker is terminated. Dropping an entry closes its
//!   completion channel, which its pending value reads as abandonment.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use offrpc::Codec;
use offrpc::ContractId;
use offrpc::InvocationId;
use offrpc::TypeName;
use offrpc::WorkerId;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;

/// What a completion channel carries: the raw result text, or the failure.
pub(crate) type Outcome = Result<String>;

pub(crate) type SuccessHandler = Box<dyn FnOnce(&Codec, &str) -> anyhow::Result<()> + Send + Sync>;
pub(crate) type ErrorHandler = Box<dyn FnOnce(&Error) -> anyhow::Result<()> + Send + Sync>;
pub(crate) type EventHandler = Arc<dyn Fn(&Codec, &str) -> anyhow::Result<()> + Send + Sync>;

pub(crate) struct Entry {
    pub(crate) worker: WorkerId,
    pub(crate) contract: ContractId,
    pub(crate) method: String,
    /// The value type the success handler decodes, when it decodes one.
    pub(crate) expected: Option<TypeName>,
    on_success: Option<SuccessHandler>,
    on_error: Option<ErrorHandler>,
    events: HashMap<String, EventHandler>,
    completion: Option<oneshot::Sender<Outcome>>,
    dispatched: bool,
}

impl Entry {
    fn new(worker: WorkerId, contract: ContractId, method: impl Into<String>) -> Self {
        Self {
            worker,
            contract,
            method: method.into(),
            expected: None,
            on_success: None,
            on_error: None,
            events: HashMap::new(),
            completion: None,
            dispatched: false,
        }
    }

    /// Delivers a result. A failing success callback turns the outcome into
    /// an error, which goes down the error path instead.
    pub(crate) fn succeed(mut self, id: InvocationId, codec: &Codec, raw: String) {
        if let Some(on_success) = self.on_success.take() {
            if let Err(e) = on_success(codec, &raw) {
                error!(invocation = %id, contract = %self.contract, method = %self.method, error = %e, "success callback failed");
                self.fail(id, Error::Callback(format!("{:#}", e)));
                return;
            }
        } else if self.completion.is_none() {
            debug!(invocation = %id, method = %self.method, "no success callback registered");
        }

        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Ok(raw));
        }
    }

    /// Delivers a failure to the error callback and the pending value.
    pub(crate) fn fail(mut self, id: InvocationId, error: Error) {
        match self.on_error.take() {
            Some(on_error) => {
                if let Err(e) = on_error(&error) {
                    error!(invocation = %id, method = %self.method, error = %e, "error callback failed");
                }
            }
            None if self.completion.is_some() => {
                debug!(invocation = %id, method = %self.method, %error, "failure goes to pending value only");
            }
            None => {
                warn!(invocation = %id, contract = %self.contract, method = %self.method, %error, "no error callback registered; dropping error");
            }
        }

        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Err(error));
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: DashMap<InvocationId, Entry>,
}

impl Registry {
    /// Binds success and error handlers to a fresh invocation.
    pub(crate) fn register(
        &self,
        id: InvocationId,
        worker: WorkerId,
        contract: ContractId,
        method: &str,
        expected: Option<TypeName>,
        on_success: SuccessHandler,
        on_error: ErrorHandler,
    ) {
        let mut entry = Entry::new(worker, contract, method);
        entry.expected = expected;
        entry.on_success = Some(on_success);
        entry.on_error = Some(on_error);
        self.entries.insert(id, entry);
    }

    /// Attaches an event handler to a registered invocation. Returns false
    /// when the invocation is unknown.
    pub(crate) fn add_event(&self, id: InvocationId, event: &str, handler: EventHandler) -> bool {
        match self.entries.get_mut(&id) {
            Some(mut entry) => {
                entry.events.insert(event.to_string(), handler);
                true
            }
            None => false,
        }
    }

    /// Routes the eventual outcome of `id` into `tx`, creating the entry
    /// for calls made without registered callbacks.
    pub(crate) fn complete_into(
        &self,
        id: InvocationId,
        worker: WorkerId,
        contract: &ContractId,
        method: &str,
        tx: oneshot::Sender<Outcome>,
    ) {
        self.entries
            .entry(id)
            .or_insert_with(|| Entry::new(worker, contract.clone(), method))
            .completion = Some(tx);
    }

    /// Marks `id` as sent. Fails when it was registered for another method.
    pub(crate) fn mark_dispatched(&self, id: InvocationId, method: &str) -> Result<()> {
        let Some(mut entry) = self.entries.get_mut(&id) else {
            return Ok(());
        };
        if entry.method != method {
            return Err(Error::ShapeMismatch {
                method: method.to_string(),
                details: format!("{} was registered for '{}'", id, entry.method),
            });
        }
        entry.dispatched = true;
        Ok(())
    }

    pub(crate) fn expected(&self, id: InvocationId) -> Option<TypeName> {
        self.entries.get(&id).and_then(|entry| entry.expected.clone())
    }

    pub(crate) fn event_handler(&self, id: InvocationId, event: &str) -> Option<EventHandler> {
        self.entries.get(&id).and_then(|entry| entry.events.get(event).cloned())
    }

    pub(crate) fn take(&self, id: InvocationId) -> Option<Entry> {
        self.entries.remove(&id).map(|(_, entry)| entry)
    }

    /// Drops every entry bound to `worker`. Their callbacks never fire.
    pub(crate) fn prune_worker(&self, worker: WorkerId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.worker != worker);
        before.saturating_sub(self.entries.len())
    }

    /// Drops every entry.
    pub(crate) fn abandon_all(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.entries.iter().filter(|entry| entry.dispatched).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
