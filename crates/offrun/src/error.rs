//! # Error Taxonomy
//!
//! Every way a remote invocation can go wrong, from a badly shaped contract
//! at build time to a worker that stopped answering.
//!
//! ## Classes
//! - **Contract shape** (`NotAContract`, `MalformedContract`): fatal, raised
//!   when a stand-in is first requested.
//! - **Caller mistakes** (`UnknownMethod`, `ReturnTypeMismatch`,
//!   `UnknownEvent`, `InvocationMismatch`, ...): raised synchronously at
//!   registration or call time.
//! - **Recoverable** (`CredentialExpired`): triggers one refresh and replay.
//! - **Protocol desync** (`WorkerNotFound`, `NoCallbacksRegistered`):
//!   raised to the direct caller, logged by the pump.
//! - **Fatal** (`WorkerFault`, `Transport`): stops the message pump.

use std::fmt;

use offrpc::ContractId;
use offrpc::InvocationId;
use offrpc::TypeName;
use offrpc::WorkerId;

use crate::settings;
use crate::transport;

#[derive(Debug)]
pub enum Error {
    NotAContract(ContractId),
    MalformedContract { contract: ContractId, details: String },
    UnknownMethod { contract: ContractId, method: String },
    UnknownEvent { contract: ContractId, event: String },
    UnknownProperty { contract: ContractId, property: String },
    ReturnTypeMismatch { method: String, declared: TypeName, expected: TypeName },
    EventTypeMismatch { event: String, declared: TypeName, expected: TypeName },
    /// The stand-in was used in a way that disagrees with the method's return shape.
    ShapeMismatch { method: String, details: String },
    /// Arguments or generic witnesses did not match the declaration.
    BadArguments { method: String, details: String },
    InvocationMismatch { expected: Option<InvocationId>, received: InvocationId },
    MissingArgument { method: String, name: String },
    WorkerNotFound(WorkerId),
    NoCallbacksRegistered(WorkerId),
    ServiceNotFound(ContractId),
    /// The worker has not received its `Create` message yet.
    WorkerNotCreated,
    /// The remote implementation failed; the text is the remote error.
    Remote(String),
    CredentialExpired(String),
    /// A caller-supplied callback returned an error.
    Callback(String),
    /// A worker-level fault with no invocation attached.
    WorkerFault { worker: Option<WorkerId>, error: String },
    /// The invocation will never complete: its worker or pump went away.
    Abandoned(InvocationId),
    NoRuntime,
    Protocol(offrpc::Error),
    Transport(transport::Error),
    Settings(settings::Error),
}

impl Error {
    /// Whether this error must stop the message pump.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::WorkerFault { .. }
                | Self::Transport(_)
                | Self::NotAContract(_)
                | Self::MalformedContract { .. }
        )
    }

    /// The credential-expired signal that starts a refresh.
    pub fn is_credential_expired(&self) -> bool {
        matches!(self, Self::CredentialExpired(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAContract(id) => write!(f, "'{}' is not a contract", id),
            Self::MalformedContract { contract, details } => {
                write!(f, "Contract '{}' is malformed: {}", contract, details)
            }
            Self::UnknownMethod { contract, method } => {
                write!(f, "Method '{}' is not declared on '{}'", method, contract)
            }
            Self::UnknownEvent { contract, event } => {
                write!(f, "Event '{}' is not declared on '{}'", event, contract)
            }
            Self::UnknownProperty { contract, property } => {
                write!(f, "Property '{}' is not declared on '{}'", property, contract)
            }
            Self::ReturnTypeMismatch { method, declared, expected } => write!(
                f,
                "'{}' returns {} but the callback expects {}",
                method, declared, expected
            ),
            Self::EventTypeMismatch { event, declared, expected } => write!(
                f,
                "Event '{}' carries {} but the callback expects {}",
                event, declared, expected
            ),
            Self::ShapeMismatch { method, details } => {
                write!(f, "'{}' called with the wrong shape: {}", method, details)
            }
            Self::BadArguments { method, details } => {
                write!(f, "Bad arguments for '{}': {}", method, details)
            }
            Self::InvocationMismatch { expected: Some(expected), received } => write!(
                f,
                "Invocation mismatch: expected {}, received {}",
                expected, received
            ),
            Self::InvocationMismatch { expected: None, received } => write!(
                f,
                "Invocation mismatch: no invocation is pending, received {}",
                received
            ),
            Self::MissingArgument { method, name } => {
                write!(f, "Argument '{}' of '{}' is missing", name, method)
            }
            Self::WorkerNotFound(id) => write!(f, "Worker not found: {}", id),
            Self::NoCallbacksRegistered(id) => {
                write!(f, "No creation callbacks are registered for {}", id)
            }
            Self::ServiceNotFound(id) => write!(f, "No service implements '{}'", id),
            Self::WorkerNotCreated => write!(f, "Worker has not been created"),
            Self::Remote(e) => write!(f, "Remote failure: {}", e),
            Self::CredentialExpired(e) => write!(f, "Credential expired: {}", e),
            Self::Callback(e) => write!(f, "Callback failed: {}", e),
            Self::WorkerFault { worker: Some(worker), error } => {
                write!(f, "Fault in {}: {}", worker, error)
            }
            Self::WorkerFault { worker: None, error } => write!(f, "Worker fault: {}", error),
            Self::Abandoned(id) => write!(f, "{} was abandoned", id),
            Self::NoRuntime => write!(f, "No tokio runtime is running"),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Settings(e) => write!(f, "Settings error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::Settings(e) => Some(e),
            _ => None,
        }
    }
}

impl From<offrpc::Error> for Error {
    fn from(e: offrpc::Error) -> Self {
        Self::Protocol(e)
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<settings::Error> for Error {
    fn from(e: settings::Error) -> Self {
        Self::Settings(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
