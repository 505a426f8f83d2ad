//! # Stand-ins
//!
//! A stand-in is the forwarding half of a contract binding. Contract types
//! wrap one and implement their methods by describing the call to it; the
//! stand-in turns the description into an envelope and hands it to the
//! dispatcher. Nothing runs locally.
//!
//! ## Dispatch Strategies
//!
//! Every method is routed by a [`Strategy`] fixed by its return shape:
//!
//! | Shape           | Strategy     | Caller receives                    |
//! |-----------------|--------------|------------------------------------|
//! | void            | `VoidSync`   | nothing                            |
//! | value           | `ValueSync`  | `T::default()` now, value later    |
//! | deferred        | `VoidAsync`  | `Pending<()>`                      |
//! | deferred value  | `ValueAsync` | `Pending<T>`                       |
//!
//! Synchronously shaped calls never wait. Their real outcome only arrives
//! through the callbacks registered for the invocation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use dashmap::DashMap;
use offrpc::ContractId;
use offrpc::Envelope;
use offrpc::InvocationId;
use offrpc::TypeName;
use offrpc::WorkerId;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::contract::Descriptor;
use crate::contract::MethodDescriptor;
use crate::contract::ReturnShape;
use crate::contract::TypeRef;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::error::Result;
use crate::pending::Pending;
use crate::registry::Outcome;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Strategy {
    VoidSync,
    ValueSync,
    VoidAsync,
    ValueAsync,
}

impl Strategy {
    pub fn for_shape(shape: &ReturnShape) -> Self {
        match shape {
            ReturnShape::Void => Self::VoidSync,
            ReturnShape::Value(_) => Self::ValueSync,
            ReturnShape::Deferred => Self::VoidAsync,
            ReturnShape::DeferredValue(_) => Self::ValueAsync,
        }
    }

    pub fn is_async(self) -> bool {
        matches!(self, Self::VoidAsync | Self::ValueAsync)
    }
}

/// How one method is forwarded.
#[derive(Clone, Debug)]
pub struct Route {
    pub strategy: Strategy,
    pub method: MethodDescriptor,
}

/// The per-contract table of routes, keyed by method name.
#[derive(Debug)]
pub struct ForwardingTable {
    contract: ContractId,
    routes: BTreeMap<String, Route>,
}

impl ForwardingTable {
    pub(crate) fn build(descriptor: &Descriptor) -> Self {
        let routes = descriptor
            .methods
            .values()
            .map(|method| {
                let route = Route {
                    strategy: Strategy::for_shape(&method.returns),
                    method: method.clone(),
                };
                (method.name.clone(), route)
            })
            .collect();
        Self {
            contract: descriptor.id.clone(),
            routes,
        }
    }

    pub fn route(&self, method: &str) -> Result<&Route> {
        self.routes.get(method).ok_or_else(|| Error::UnknownMethod {
            contract: self.contract.clone(),
            method: method.to_string(),
        })
    }
}

/// The forwarding state behind one contract binding.
///
/// One stand-in exists per (contract, worker, upload context) binding. It
/// holds only what identifies its calls: the worker, the invocation id
/// minted by the last callback registration, and the events its caller
/// listens to. Everything else belongs to the dispatcher.
pub struct StandIn {
    descriptor: Arc<Descriptor>,
    table: Arc<ForwardingTable>,
    worker: WorkerId,
    upload_context: Option<String>,
    invocation: Mutex<Option<InvocationId>>,
    events: Mutex<BTreeMap<String, TypeName>>,
    properties: DashMap<String, Value>,
    dispatcher: Dispatcher,
}

impl StandIn {
    pub(crate) fn new(
        descriptor: Arc<Descriptor>,
        table: Arc<ForwardingTable>,
        worker: WorkerId,
        upload_context: Option<String>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            descriptor,
            table,
            worker,
            upload_context,
            invocation: Mutex::new(None),
            events: Mutex::new(BTreeMap::new()),
            properties: DashMap::new(),
            dispatcher,
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn contract(&self) -> &ContractId {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn upload_context(&self) -> Option<&str> {
        self.upload_context.as_deref()
    }

    /// The id the next call will use, if callbacks were registered for it.
    pub fn pending_invocation(&self) -> Option<InvocationId> {
        *self.invocation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamps `id` for the next call. Returns the id it replaces, if any.
    pub(crate) fn stamp(&self, id: InvocationId) -> Option<InvocationId> {
        self.invocation.lock().unwrap_or_else(PoisonError::into_inner).replace(id)
    }

    fn take_invocation(&self) -> Option<InvocationId> {
        self.invocation.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Starts listening to `event`. Only the local registration changes;
    /// the next call carries it to the worker.
    pub fn add_event(&self, event: &str) -> Result<()> {
        let declared = self.descriptor.event(event)?;
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(declared.name.clone(), declared.arg_type.clone());
        Ok(())
    }

    pub fn remove_event(&self, event: &str) -> bool {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event)
            .is_some()
    }

    /// A snapshot of the events this stand-in listens to.
    pub fn events(&self) -> BTreeMap<String, TypeName> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Reads a property. Properties live on the stand-in and never cross
    /// the channel; unset properties read as `T::default()`.
    pub fn get<T: DeserializeOwned + Default>(&self, property: &str) -> Result<T> {
        self.descriptor.property(property)?;
        match self.properties.get(property) {
            Some(value) => Ok(self.dispatcher.codec().from_value(value.value().clone())?),
            None => Ok(T::default()),
        }
    }

    pub fn set<T: Serialize + ?Sized>(&self, property: &str, value: &T) -> Result<()> {
        let declared = self.descriptor.property(property)?;
        let value = self.dispatcher.codec().to_value(value)?;
        self.properties.insert(declared.name.clone(), value);
        Ok(())
    }

    /// Starts describing a call to `method`.
    pub fn method(&self, method: &str) -> Call<'_> {
        Call {
            stand_in: self,
            method: method.to_string(),
            generics: Vec::new(),
            args: Vec::new(),
            error: None,
        }
    }
}

/// One call being described.
///
/// Mistakes made while describing (an unserializable argument, the wrong
/// number of arguments, an undeclared method) surface when the call is
/// forwarded, through the invocation's error path.
#[must_use = "a call does nothing until it is forwarded"]
pub struct Call<'a> {
    stand_in: &'a StandIn,
    method: String,
    generics: Vec<TypeName>,
    args: Vec<Value>,
    error: Option<Error>,
}

impl Call<'_> {
    /// Supplies the witness for the next generic parameter.
    pub fn generic<T: ?Sized>(mut self) -> Self {
        self.generics.push(TypeName::of::<T>());
        self
    }

    /// Supplies the next argument, in declaration order.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match self.stand_in.dispatcher.codec().to_value(value) {
            Ok(value) => self.args.push(value),
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(e.into());
                }
            }
        }
        self
    }

    /// Forwards a void method.
    pub fn call(self) {
        let (id, result) = self.forward(Strategy::VoidSync, None, None);
        if let Err(e) = result {
            self.stand_in.dispatcher.fail(id, e);
        }
    }

    /// Forwards a value method. Returns a placeholder at once; the value is
    /// delivered to the invocation's success callback.
    pub fn call_value<T: Default>(self) -> T {
        let (id, result) = self.forward(Strategy::ValueSync, Some(TypeName::of::<T>()), None);
        if let Err(e) = result {
            self.stand_in.dispatcher.fail(id, e);
        }
        T::default()
    }

    /// Forwards a deferred method.
    pub fn call_async(self) -> Pending<()> {
        self.forward_pending(Strategy::VoidAsync, None)
    }

    /// Forwards a deferred value method.
    pub fn call_async_value<T: DeserializeOwned + Send + 'static>(self) -> Pending<T> {
        self.forward_pending(Strategy::ValueAsync, Some(TypeName::of::<T>()))
    }

    fn forward_pending<T: DeserializeOwned + Send + 'static>(
        self,
        strategy: Strategy,
        wants: Option<TypeName>,
    ) -> Pending<T> {
        let dispatcher = self.stand_in.dispatcher.clone();
        let (tx, rx) = oneshot::channel();
        let (id, result) = self.forward(strategy, wants, Some(tx));
        if let Err(e) = result {
            dispatcher.fail(id, e);
        }
        Pending::new(id, rx, *dispatcher.codec())
    }

    /// Validates the call against its route, builds the envelope, and hands
    /// it to the dispatcher. The invocation id is settled first so failures
    /// can be routed to whoever registered for it.
    fn forward(
        &self,
        used_as: Strategy,
        wants: Option<TypeName>,
        completion: Option<oneshot::Sender<Outcome>>,
    ) -> (InvocationId, Result<()>) {
        let stand_in = self.stand_in;
        let dispatcher = &stand_in.dispatcher;
        let id = stand_in
            .take_invocation()
            .unwrap_or_else(|| dispatcher.next_invocation());

        if let Some(tx) = completion {
            dispatcher.registry().complete_into(id, stand_in.worker, stand_in.contract(), &self.method, tx);
        }

        let result = self.envelope(used_as, wants, id).and_then(|envelope| {
            debug!(invocation = %id, worker = %stand_in.worker, %envelope, "forwarding call");
            dispatcher.dispatch(stand_in, id, envelope)
        });
        (id, result)
    }

    fn envelope(&self, used_as: Strategy, wants: Option<TypeName>, id: InvocationId) -> Result<Envelope> {
        if let Some(e) = &self.error {
            return Err(Error::BadArguments {
                method: self.method.clone(),
                details: e.to_string(),
            });
        }

        let route = self.stand_in.table.route(&self.method)?;
        let method = &route.method;
        if route.strategy != used_as {
            return Err(Error::ShapeMismatch {
                method: self.method.clone(),
                details: format!("declared {:?}, called as {:?}", route.strategy, used_as),
            });
        }
        if self.generics.len() != method.generics.len() {
            return Err(Error::BadArguments {
                method: self.method.clone(),
                details: format!(
                    "expected {} generic witnesses, got {}",
                    method.generics.len(),
                    self.generics.len()
                ),
            });
        }
        if self.args.len() != method.params.len() {
            return Err(Error::BadArguments {
                method: self.method.clone(),
                details: format!("expected {} arguments, got {}", method.params.len(), self.args.len()),
            });
        }

        let return_type = match method.returns.value_type() {
            Some(ty) => self.resolve(method, ty)?,
            None => TypeName::unit(),
        };

        // Generic return types are only known now, so registrations made
        // against them are checked here.
        if method.returns.value_type().is_some() {
            let registered = self.stand_in.dispatcher.registry().expected(id);
            for expected in wants.into_iter().chain(registered) {
                if expected != return_type {
                    return Err(Error::ReturnTypeMismatch {
                        method: self.method.clone(),
                        declared: return_type,
                        expected,
                    });
                }
            }
        }

        let names = method.params.iter().map(|p| p.name.clone()).collect();
        let types = method
            .params
            .iter()
            .map(|p| self.resolve(method, &p.ty))
            .collect::<Result<Vec<_>>>()?;

        Ok(Envelope::from_parts(
            self.stand_in.contract().clone(),
            &self.method,
            return_type,
            self.generics.clone(),
            names,
            types,
            self.args.clone(),
        )?)
    }

    fn resolve(&self, method: &MethodDescriptor, ty: &TypeRef) -> Result<TypeName> {
        method.resolve(ty, &self.generics).ok_or_else(|| Error::BadArguments {
            method: self.method.clone(),
            details: format!("unresolved generic {:?}", ty),
        })
    }
}
