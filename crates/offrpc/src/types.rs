//! # Identifiers
//!
//! Strong types for everything that is referred to by name once it leaves
//! the process: invocations, workers, contracts, and value types.
//!
//! ## Invariants
//! - **Stable Type Names**: a `TypeName` is produced by `std::any::type_name`
//!   on both sides of the channel, so the same Rust type always carries the
//!   same name within one build.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Correlates every message that belongs to one remote call.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(pub u64);

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invocation-{}", self.0)
    }
}

/// Strong type for worker identifiers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Addresses one end of the channel.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextId {
    Primary,
    Worker(WorkerId),
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Worker(id) => write!(f, "{}", id),
        }
    }
}

impl From<WorkerId> for ContextId {
    fn from(id: WorkerId) -> Self {
        Self::Worker(id)
    }
}

/// The stable identity of a contract, shared by stand-ins and services.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractId(String);

impl ContractId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContractId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The name of a value type as it travels on the wire.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeName(String);

impl TypeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name of `T`.
    pub fn of<T: ?Sized>() -> Self {
        Self(std::any::type_name::<T>().to_string())
    }

    /// The name used for "no value".
    pub fn unit() -> Self {
        Self::of::<()>()
    }

    pub fn is_unit(&self) -> bool {
        self.0 == "()"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether values of this type are strings on the wire and may arrive
    /// without JSON quoting.
    pub fn is_textual(&self) -> bool {
        matches!(self.0.as_str(), "alloc::string::String" | "&str" | "str" | "char")
    }

    /// Whether this names a scalar that may arrive as a bare string.
    pub fn is_primitive(&self) -> bool {
        self.is_textual()
            || matches!(
                self.0.as_str(),
                "bool"
                    | "i8" | "i16" | "i32" | "i64" | "i128" | "isize"
                    | "u8" | "u16" | "u32" | "u64" | "u128" | "usize"
                    | "f32" | "f64"
            )
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
