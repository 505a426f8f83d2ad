//! # OffRPC
//!
//! The wire protocol spoken between a primary context and its workers.
//!
//! ## Architecture
//!
//! Everything here is plain data. An [`Envelope`] describes one call, a
//! [`Message`] wraps it (or its outcome) for the channel, and the [`Codec`]
//! moves individual values in and out of their textual form. Nothing in this
//! crate knows about callbacks, tasks, or transports.

pub mod codec;
pub mod credential;
pub mod envelope;
pub mod error;
pub mod message;
pub mod types;

pub use codec::Codec;
pub use credential::Credential;
pub use envelope::Envelope;
pub use envelope::Parameter;
pub use error::Error;
pub use error::Result;
pub use message::Message;
pub use types::ContextId;
pub use types::ContractId;
pub use types::InvocationId;
pub use types::TypeName;
pub use types::WorkerId;
