//! # Invocation Envelope
//!
//! The wire description of one call: which contract, which method, which
//! concrete types were chosen for the method's generic parameters, and the
//! arguments in declaration order.
//!
//! ## Invariants
//! - **Symmetric Parameters**: every parameter carries exactly one name, one
//!   type, and one value. Envelopes assembled from separate arrays are
//!   rejected when the arrays disagree in length.
//! - **Unique Names**: a parameter name appears at most once.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;
use crate::types::ContractId;
use crate::types::TypeName;

/// One argument of a call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub type_name: TypeName,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub contract: ContractId,
    pub method: String,
    /// The declared value type of the method, after generic resolution.
    /// Unit for methods that produce no value.
    pub return_type: TypeName,
    #[serde(default)]
    pub generic_types: Vec<TypeName>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl Envelope {
    pub fn new(contract: ContractId, method: impl Into<String>, return_type: TypeName) -> Self {
        Self {
            contract,
            method: method.into(),
            return_type,
            generic_types: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Builds an envelope from parallel name, type, and value arrays.
    pub fn from_parts(
        contract: ContractId,
        method: impl Into<String>,
        return_type: TypeName,
        generic_types: Vec<TypeName>,
        names: Vec<String>,
        types: Vec<TypeName>,
        values: Vec<Value>,
    ) -> Result<Self> {
        let method = method.into();
        if names.len() != types.len() || names.len() != values.len() {
            return Err(Error::AsymmetricParameters {
                method,
                names: names.len(),
                types: types.len(),
                values: values.len(),
            });
        }

        let mut envelope = Self::new(contract, method, return_type).with_generics(generic_types);
        for ((name, type_name), value) in names.into_iter().zip(types).zip(values) {
            envelope.add_parameter(name, type_name, value)?;
        }
        Ok(envelope)
    }

    pub fn with_generics(mut self, generic_types: Vec<TypeName>) -> Self {
        self.generic_types = generic_types;
        self
    }

    /// Appends a parameter after the ones already present.
    pub fn add_parameter(
        &mut self,
        name: impl Into<String>,
        type_name: TypeName,
        value: Value,
    ) -> Result<()> {
        let name = name.into();
        if self.parameter(&name).is_some() {
            return Err(Error::DuplicateParameter { method: self.method.clone(), name });
        }
        self.parameters.push(Parameter { name, type_name, value });
        Ok(())
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.contract, self.method)?;
        if !self.generic_types.is_empty() {
            let generics: Vec<&str> = self.generic_types.iter().map(TypeName::as_str).collect();
            write!(f, "<{}>", generics.join(", "))?;
        }
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|p| format!("{}: {}", p.name, p.type_name))
            .collect();
        write!(f, "({})", params.join(", "))
    }
}
