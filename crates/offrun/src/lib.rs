//! # OffRun
//!
//! Runs calls against contracts whose implementations live in workers.
//!
//! ## Architecture
//!
//! The primary holds a [`Dispatcher`]. It hands out stand-ins for contracts
//! bound to a worker; calling a stand-in sends an `Invoke` and returns at
//! once, and the outcome comes back through callbacks or a [`Pending`]
//! value. The worker runs a [`Host`] that owns the real [`Service`]s and
//! answers each invocation. A [`Transport`] carries the frames between them.

pub mod contract;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod pending;
pub mod refresh;
pub(crate) mod registry;
pub mod settings;
pub mod standin;
pub mod transport;
pub mod workers;

pub use contract::Contract;
pub use contract::Declaration;
pub use contract::Descriptor;
pub use contract::Method;
pub use dispatcher::Dispatcher;
pub use dispatcher::DispatcherBuilder;
pub use error::Error;
pub use error::Result;
pub use host::Host;
pub use host::HostBuilder;
pub use host::Invocation;
pub use host::Service;
pub use pending::Pending;
pub use refresh::RefreshCoordinator;
pub use settings::RefreshPolicy;
pub use settings::Settings;
pub use standin::StandIn;
pub use transport::Endpoint;
pub use transport::Switchboard;
pub use transport::Transport;
pub use workers::CreateStatus;
pub use workers::ReadyStatus;
pub use workers::WorkerState;
