//! # Protocol Messages
//!
//! Every shape that crosses the channel, as one enum tagged by `command`.
//!
//! ## Invariants
//! - **Whole Frames**: one message is one payload. `decode` never reads past
//!   the frame and rejects empty frames.
//! - **One Terminal Message**: for each invocation the worker sends zero or
//!   more `Event`s, then exactly one `Result` or `Error`.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::credential::Credential;
use crate::envelope::Envelope;
use crate::error::Error;
use crate::error::Result;
use crate::types::InvocationId;
use crate::types::TypeName;
use crate::types::WorkerId;

/// A call on its way to a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvokeMessage {
    pub invocation: InvocationId,
    pub worker: WorkerId,
    pub envelope: Envelope,
    /// Event name to event argument type, for the events the caller listens to.
    #[serde(default)]
    pub events: BTreeMap<String, TypeName>,
    #[serde(default)]
    pub upload_context: Option<String>,
}

/// A successful outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub invocation: InvocationId,
    pub envelope: Envelope,
    /// The returned value, in codec text form.
    pub value: String,
}

/// A failed outcome, or a worker-level fault when no invocation is attached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(default)]
    pub invocation: Option<InvocationId>,
    #[serde(default)]
    pub worker: Option<WorkerId>,
    #[serde(default)]
    pub envelope: Option<Envelope>,
    pub error: String,
}

impl ErrorMessage {
    /// An error scoped to one invocation.
    pub fn call(invocation: InvocationId, envelope: Envelope, error: impl Into<String>) -> Self {
        Self {
            invocation: Some(invocation),
            worker: None,
            envelope: Some(envelope),
            error: error.into(),
        }
    }

    /// An error with no invocation context: the worker itself is broken.
    pub fn fault(worker: Option<WorkerId>, error: impl Into<String>) -> Self {
        Self {
            invocation: None,
            worker,
            envelope: None,
            error: error.into(),
        }
    }

    /// The invocation and envelope of a call-scoped error; `None` for a
    /// worker-level fault.
    pub fn call_scope(&self) -> Option<(InvocationId, &Envelope)> {
        self.invocation.zip(self.envelope.as_ref())
    }

    pub fn is_call_scoped(&self) -> bool {
        self.call_scope().is_some()
    }
}

/// An event raised by the worker while an invocation is still running.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub invocation: InvocationId,
    pub event: String,
    pub arg_type: TypeName,
    /// The event argument, in codec text form.
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Message {
    /// Primary to worker: start up with these settings.
    Create {
        worker: WorkerId,
        settings: BTreeMap<String, String>,
        credential: Option<Credential>,
    },
    /// Worker to primary: settings received, ready for calls.
    WorkerReady { worker: WorkerId },
    Invoke(InvokeMessage),
    Result(ResultMessage),
    Error(ErrorMessage),
    Event(EventMessage),
    /// Primary to worker: replace the current credential.
    Credential { credential: Credential },
    /// Worker to primary: the credential expired mid-call.
    CredentialRefreshRequest { worker: WorkerId },
    /// Primary to worker: the fresh secret.
    CredentialRefreshResponse { secret: String },
    Terminate { worker: WorkerId },
}

impl Message {
    /// The `command` tag, for logging.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::WorkerReady { .. } => "worker-ready",
            Self::Invoke(_) => "invoke",
            Self::Result(_) => "result",
            Self::Error(_) => "error",
            Self::Event(_) => "event",
            Self::Credential { .. } => "credential",
            Self::CredentialRefreshRequest { .. } => "credential-refresh-request",
            Self::CredentialRefreshResponse { .. } => "credential-refresh-response",
            Self::Terminate { .. } => "terminate",
        }
    }

    pub fn invocation(&self) -> Option<InvocationId> {
        match self {
            Self::Invoke(m) => Some(m.invocation),
            Self::Result(m) => Some(m.invocation),
            Self::Error(m) => m.invocation,
            Self::Event(m) => Some(m.invocation),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(Error::EmptyMessage);
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

