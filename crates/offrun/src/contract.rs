//! # Contract Descriptors
//!
//! A contract is the shape of something a worker implements: methods with
//! their parameters, generic parameters, and return shapes; events with
//! their argument types; and properties.
//!
//! ## Philosophy
//!
//! - **Declared, not reflected**: a contract describes itself through a
//!   [`Declaration`]. The declaration is validated once, when a stand-in is
//!   first requested, and the resulting [`Descriptor`] is immutable.
//! - **Process-scoped cache**: the [`Catalog`] owned by a dispatcher keeps
//!   one descriptor per contract type for as long as the dispatcher lives.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use offrpc::ContractId;
use offrpc::TypeName;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;
use crate::standin::ForwardingTable;
use crate::standin::StandIn;

/// A type that can be stood in for by a forwarding object.
///
/// Implemented by the forwarding type itself: `bind` wraps the [`StandIn`]
/// the dispatcher built, and the contract's trait methods forward through it.
pub trait Contract: Sized + Send + Sync + 'static {
    fn declare() -> Declaration;

    fn bind(stand_in: StandIn) -> Self;

    fn stand_in(&self) -> &StandIn;
}

/// A parameter or return type: either concrete, or one of the method's
/// generic parameters, resolved at the call site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeRef {
    Concrete(TypeName),
    Generic(String),
}

/// What a method hands back to its caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReturnShape {
    /// Nothing.
    Void,
    /// A value, synchronously shaped.
    Value(TypeRef),
    /// A pending completion carrying no value.
    Deferred,
    /// A pending value.
    DeferredValue(TypeRef),
}

impl ReturnShape {
    /// The type of value the method produces, if any.
    pub fn value_type(&self) -> Option<&TypeRef> {
        match self {
            Self::Void | Self::Deferred => None,
            Self::Value(ty) | Self::DeferredValue(ty) => Some(ty),
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred | Self::DeferredValue(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamDescriptor {
    pub name: String,
    pub ty: TypeRef,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub generics: Vec<String>,
    pub params: Vec<ParamDescriptor>,
    pub returns: ReturnShape,
}

impl MethodDescriptor {
    /// Substitutes call-site witnesses for the method's generic parameters.
    pub fn resolve(&self, ty: &TypeRef, witnesses: &[TypeName]) -> Option<TypeName> {
        match ty {
            TypeRef::Concrete(name) => Some(name.clone()),
            TypeRef::Generic(param) => self
                .generics
                .iter()
                .position(|g| g == param)
                .and_then(|index| witnesses.get(index))
                .cloned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventDescriptor {
    pub name: String,
    pub arg_type: TypeName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub type_name: TypeName,
}

/// The validated shape of one contract.
#[derive(Clone, Debug)]
pub struct Descriptor {
    pub id: ContractId,
    pub methods: BTreeMap<String, MethodDescriptor>,
    pub events: BTreeMap<String, EventDescriptor>,
    pub properties: BTreeMap<String, PropertyDescriptor>,
}

impl Descriptor {
    pub fn method(&self, name: &str) -> Result<&MethodDescriptor> {
        self.methods.get(name).ok_or_else(|| Error::UnknownMethod {
            contract: self.id.clone(),
            method: name.to_string(),
        })
    }

    pub fn event(&self, name: &str) -> Result<&EventDescriptor> {
        self.events.get(name).ok_or_else(|| Error::UnknownEvent {
            contract: self.id.clone(),
            event: name.to_string(),
        })
    }

    pub fn property(&self, name: &str) -> Result<&PropertyDescriptor> {
        self.properties.get(name).ok_or_else(|| Error::UnknownProperty {
            contract: self.id.clone(),
            property: name.to_string(),
        })
    }
}

/// Fluent declaration of a method.
#[derive(Clone, Debug)]
pub struct Method {
    name: String,
    generics: Vec<String>,
    params: Vec<ParamDescriptor>,
    returns: ReturnShape,
}

impl Method {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generics: Vec::new(),
            params: Vec::new(),
            returns: ReturnShape::Void,
        }
    }

    /// Declares a generic parameter. Witnesses are given in this order.
    pub fn generic(mut self, name: impl Into<String>) -> Self {
        self.generics.push(name.into());
        self
    }

    pub fn param<T: ?Sized>(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamDescriptor {
            name: name.into(),
            ty: TypeRef::Concrete(TypeName::of::<T>()),
        });
        self
    }

    /// A parameter typed by one of the method's generic parameters.
    pub fn generic_param(mut self, name: impl Into<String>, generic: impl Into<String>) -> Self {
        self.params.push(ParamDescriptor {
            name: name.into(),
            ty: TypeRef::Generic(generic.into()),
        });
        self
    }

    pub fn returns<T>(mut self) -> Self {
        self.returns = ReturnShape::Value(TypeRef::Concrete(TypeName::of::<T>()));
        self
    }

    pub fn returns_generic(mut self, generic: impl Into<String>) -> Self {
        self.returns = ReturnShape::Value(TypeRef::Generic(generic.into()));
        self
    }

    pub fn deferred(mut self) -> Self {
        self.returns = ReturnShape::Deferred;
        self
    }

    pub fn deferred_value<T>(mut self) -> Self {
        self.returns = ReturnShape::DeferredValue(TypeRef::Concrete(TypeName::of::<T>()));
        self
    }

    pub fn deferred_generic(mut self, generic: impl Into<String>) -> Self {
        self.returns = ReturnShape::DeferredValue(TypeRef::Generic(generic.into()));
        self
    }

    fn validate(self, contract: &ContractId) -> Result<MethodDescriptor> {
        let malformed = |details: String| Error::MalformedContract {
            contract: contract.clone(),
            details,
        };

        let mut generics = BTreeSet::new();
        for generic in &self.generics {
            if !generics.insert(generic.as_str()) {
                return Err(malformed(format!(
                    "generic parameter '{}' of '{}' is declared twice",
                    generic, self.name
                )));
            }
        }

        let bound = |ty: &TypeRef| match ty {
            TypeRef::Generic(g) => generics.contains(g.as_str()),
            TypeRef::Concrete(_) => true,
        };

        let mut names = BTreeSet::new();
        for param in &self.params {
            if !names.insert(param.name.as_str()) {
                return Err(malformed(format!(
                    "parameter '{}' of '{}' is declared twice",
                    param.name, self.name
                )));
            }
            if !bound(&param.ty) {
                return Err(malformed(format!(
                    "parameter '{}' of '{}' uses an undeclared generic",
                    param.name, self.name
                )));
            }
        }

        if let Some(ty) = self.returns.value_type() {
            if !bound(ty) {
                return Err(malformed(format!(
                    "return type of '{}' uses an undeclared generic",
                    self.name
                )));
            }
        }

        Ok(MethodDescriptor {
            name: self.name,
            generics: self.generics,
            params: self.params,
            returns: self.returns,
        })
    }
}

/// The members a contract declares, before validation.
#[derive(Clone, Debug)]
pub struct Declaration {
    id: ContractId,
    methods: Vec<Method>,
    events: Vec<EventDescriptor>,
    properties: Vec<PropertyDescriptor>,
}

impl Declaration {
    pub fn new(id: impl Into<ContractId>) -> Self {
        Self {
            id: id.into(),
            methods: Vec::new(),
            events: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    pub fn event<T>(mut self, name: impl Into<String>) -> Self {
        self.events.push(EventDescriptor {
            name: name.into(),
            arg_type: TypeName::of::<T>(),
        });
        self
    }

    pub fn property<T>(mut self, name: impl Into<String>) -> Self {
        self.properties.push(PropertyDescriptor {
            name: name.into(),
            type_name: TypeName::of::<T>(),
        });
        self
    }

    /// Validates the declaration.
    ///
    /// A contract needs an id and at least one member. Member names must be
    /// unique across methods, events, and properties.
    pub fn describe(self) -> Result<Descriptor> {
        if self.id.is_empty()
            || (self.methods.is_empty() && self.events.is_empty() && self.properties.is_empty())
        {
            return Err(Error::NotAContract(self.id));
        }

        let mut members = BTreeSet::new();
        let mut claim = |name: &str| -> Result<()> {
            if members.insert(name.to_string()) {
                Ok(())
            } else {
                Err(Error::MalformedContract {
                    contract: self.id.clone(),
                    details: format!("member '{}' is declared twice", name),
                })
            }
        };

        let mut methods = BTreeMap::new();
        for method in self.methods {
            claim(&method.name)?;
            let method = method.validate(&self.id)?;
            methods.insert(method.name.clone(), method);
        }

        let mut events = BTreeMap::new();
        for event in self.events {
            claim(&event.name)?;
            events.insert(event.name.clone(), event);
        }

        let mut properties = BTreeMap::new();
        for property in self.properties {
            claim(&property.name)?;
            properties.insert(property.name.clone(), property);
        }

        Ok(Descriptor {
            id: self.id,
            methods,
            events,
            properties,
        })
    }
}

/// Descriptors and forwarding tables, built once per contract type.
#[derive(Default)]
pub(crate) struct Catalog {
    descriptors: DashMap<TypeId, Arc<Descriptor>>,
    tables: DashMap<TypeId, Arc<ForwardingTable>>,
}

impl Catalog {
    pub(crate) fn descriptor<C: Contract>(&self) -> Result<Arc<Descriptor>> {
        let key = TypeId::of::<C>();
        if let Some(descriptor) = self.descriptors.get(&key) {
            return Ok(descriptor.clone());
        }

        let descriptor = Arc::new(C::declare().describe()?);
        debug!(contract = %descriptor.id, methods = descriptor.methods.len(), "described contract");
        Ok(self.descriptors.entry(key).or_insert(descriptor).clone())
    }

    pub(crate) fn table<C: Contract>(&self, descriptor: &Descriptor) -> Arc<ForwardingTable> {
        self.tables
            .entry(TypeId::of::<C>())
            .or_insert_with(|| Arc::new(ForwardingTable::build(descriptor)))
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.descriptors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_return_shapes() {
        let descriptor = Declaration::new("IShapes")
            .method(Method::new("Log").param::<String>("line"))
            .method(Method::new("Add").param::<i32>("a").param::<i32>("b").returns::<i32>())
            .method(Method::new("Flush").deferred())
            .method(Method::new("Fetch").deferred_value::<Vec<u8>>())
            .method(Method::new("Echo").generic("T").generic_param("value", "T").deferred_generic("T"))
            .describe()
            .unwrap();

        assert_eq!(descriptor.method("Log").unwrap().returns, ReturnShape::Void);
        assert_eq!(
            descriptor.method("Add").unwrap().returns,
            ReturnShape::Value(TypeRef::Concrete(TypeName::of::<i32>()))
        );
        assert_eq!(descriptor.method("Flush").unwrap().returns, ReturnShape::Deferred);
        assert!(descriptor.method("Fetch").unwrap().returns.is_deferred());

        let echo = descriptor.method("Echo").unwrap();
        let resolved = echo.resolve(echo.returns.value_type().unwrap(), &[TypeName::of::<u8>()]);
        assert_eq!(resolved, Some(TypeName::of::<u8>()));
        assert_eq!(echo.resolve(echo.returns.value_type().unwrap(), &[]), None);
    }

    #[test]
    fn rejects_non_contracts() {
        assert!(matches!(Declaration::new("IEmpty").describe(), Err(Error::NotAContract(_))));
        let unnamed = Declaration::new("").method(Method::new("Run"));
        assert!(matches!(unnamed.describe(), Err(Error::NotAContract(_))));
    }

    #[test]
    fn rejects_malformed_members() {
        let duplicate = Declaration::new("IDup")
            .method(Method::new("Run"))
            .event::<u32>("Run");
        assert!(matches!(duplicate.describe(), Err(Error::MalformedContract { .. })));

        let unbound = Declaration::new("IUnbound")
            .method(Method::new("Load").generic_param("key", "K"));
        assert!(matches!(unbound.describe(), Err(Error::MalformedContract { .. })));

        let unbound_return = Declaration::new("IUnbound").method(Method::new("Load").returns_generic("T"));
        assert!(matches!(unbound_return.describe(), Err(Error::MalformedContract { .. })));

        let twice = Declaration::new("ITwice")
            .method(Method::new("Put").param::<u8>("x").param::<u16>("x"));
        assert!(matches!(twice.describe(), Err(Error::MalformedContract { .. })));
    }

    #[test]
    fn unknown_members_are_named() {
        let descriptor = Declaration::new("IOne").property::<String>("Name").describe().unwrap();
        assert!(descriptor.property("Name").is_ok());
        assert!(matches!(descriptor.method("Name"), Err(Error::UnknownMethod { .. })));
        assert!(matches!(descriptor.event("Changed"), Err(Error::UnknownEvent { .. })));
    }
}
