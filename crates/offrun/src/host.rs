//! # Worker Host
//!
//! The worker's side of the protocol. The host owns the real
//! implementations, keyed by contract, and answers each `Invoke` with zero
//! or more events followed by exactly one `Result` or `Error`.
//!
//! ## Philosophy
//!
//! - **One Task per Invocation**: invocations run concurrently; a slow call
//!   or a credential refresh only holds up its own invocation.
//! - **Listen-Only Events**: a service may raise any event it declares, but
//!   only the events the caller listens to are sent.
//! - **Transparent Refresh**: a service that fails with
//!   [`Error::CredentialExpired`] gets one replay with a fresh credential.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use dashmap::DashMap;
use offrpc::Codec;
use offrpc::ContextId;
use offrpc::ContractId;
use offrpc::Credential;
use offrpc::Envelope;
use offrpc::InvocationId;
use offrpc::Message;
use offrpc::TypeName;
use offrpc::WorkerId;
use offrpc::message::ErrorMessage;
use offrpc::message::EventMessage;
use offrpc::message::InvokeMessage;
use offrpc::message::ResultMessage;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::refresh::RefreshCoordinator;
use crate::settings::RefreshPolicy;
use crate::settings::Settings;
use crate::transport;
use crate::transport::Transport;

/// A real implementation of one contract.
///
/// `call` dispatches on [`Invocation::method`] and returns the method's
/// value, or `Value::Null` for methods without one.
#[async_trait::async_trait]
pub trait Service: Send + Sync + 'static {
    async fn call(&self, call: &Invocation) -> anyhow::Result<Value>;
}

/// One invocation as a service sees it.
pub struct Invocation {
    id: InvocationId,
    worker: WorkerId,
    envelope: Envelope,
    events: BTreeMap<String, TypeName>,
    upload_context: Option<String>,
    host: Host,
}

impl Invocation {
    pub fn id(&self) -> InvocationId {
        self.id
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn contract(&self) -> &ContractId {
        &self.envelope.contract
    }

    pub fn method(&self) -> &str {
        &self.envelope.method
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Concrete types chosen for the method's generic parameters.
    pub fn generics(&self) -> &[TypeName] {
        &self.envelope.generic_types
    }

    pub fn upload_context(&self) -> Option<&str> {
        self.upload_context.as_deref()
    }

    /// Reads argument `name` as `T`.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self.arg_value(name)?;
        Ok(self.host.inner.codec.from_value(value)?)
    }

    /// Reads argument `name` as the type it was declared with. A scalar sent
    /// as a bare string is parsed as its declared type.
    pub fn arg_value(&self, name: &str) -> Result<Value> {
        let param = self.envelope.parameter(name).ok_or_else(|| Error::MissingArgument {
            method: self.envelope.method.clone(),
            name: name.to_string(),
        })?;
        let declared = &param.type_name;
        Ok(match &param.value {
            Value::String(text) if declared.is_primitive() && !declared.is_textual() => {
                self.host.inner.codec.deserialize_as(declared, text)
            }
            value => value.clone(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.host.inner.settings
    }

    pub fn credential(&self) -> Option<Credential> {
        self.host.inner.settings.credential()
    }

    pub fn listens_to(&self, event: &str) -> bool {
        self.events.contains_key(event)
    }

    /// Raises `event`. Returns false, sending nothing, when the caller is not
    /// listening to it.
    pub async fn emit<T: Serialize + ?Sized>(&self, event: &str, arg: &T) -> Result<bool> {
        let Some(arg_type) = self.events.get(event) else {
            debug!(invocation = %self.id, event, "nobody listens to event");
            return Ok(false);
        };
        let message = Message::Event(EventMessage {
            invocation: self.id,
            event: event.to_string(),
            arg_type: arg_type.clone(),
            value: self.host.inner.codec.serialize(arg),
        });
        self.host.send(&message).await?;
        Ok(true)
    }
}

struct HostInner {
    transport: Arc<dyn Transport>,
    services: DashMap<ContractId, Arc<dyn Service>>,
    settings: Arc<Settings>,
    refresh: RefreshCoordinator,
    codec: Codec,
    worker: Mutex<Option<WorkerId>>,
}

/// Fluent configuration for a [`Host`].
pub struct HostBuilder {
    transport: Arc<dyn Transport>,
    services: Vec<(ContractId, Arc<dyn Service>)>,
    settings: Option<Arc<Settings>>,
    policy: Option<RefreshPolicy>,
    codec: Codec,
}

impl HostBuilder {
    pub fn new(transport: impl Transport) -> Self {
        Self {
            transport: Arc::new(transport),
            services: Vec::new(),
            settings: None,
            policy: None,
            codec: Codec::new(),
        }
    }

    pub fn service(mut self, contract: impl Into<ContractId>, service: impl Service) -> Self {
        self.services.push((contract.into(), Arc::new(service)));
        self
    }

    pub fn settings(mut self, settings: Arc<Settings>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Fixes the refresh policy. Without one, it is read from the settings
    /// the primary sends.
    pub fn refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn build(self) -> Host {
        let settings = self.settings.unwrap_or_default();
        let services = DashMap::new();
        for (contract, service) in self.services {
            services.insert(contract, service);
        }
        Host {
            inner: Arc::new(HostInner {
                transport: self.transport,
                services,
                refresh: RefreshCoordinator::new(settings.clone(), self.policy),
                settings,
                codec: self.codec,
                worker: Mutex::new(None),
            }),
        }
    }
}

/// The worker's handle on the invocation runtime. Cheap to clone.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    pub fn builder(transport: impl Transport) -> HostBuilder {
        HostBuilder::new(transport)
    }

    /// The worker id, once the primary has created this worker.
    pub fn worker(&self) -> Option<WorkerId> {
        *self.inner.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.inner.settings
    }

    pub fn refresh(&self) -> &RefreshCoordinator {
        &self.inner.refresh
    }

    /// Runs until the primary terminates this worker or the transport closes.
    pub async fn serve(&self) -> Result<()> {
        loop {
            let frame = match self.inner.transport.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    return Err(Error::Transport(transport::Error::ConnectionLost("stream closed".into())));
                }
                Err(e) => {
                    error!(error = %e, "transport error in host");
                    return Err(e.into());
                }
            };

            let message = match Message::decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "undecodable frame");
                    let fault = ErrorMessage::fault(self.worker(), format!("undecodable frame: {}", e));
                    self.send(&Message::Error(fault)).await?;
                    continue;
                }
            };

            if let Message::Terminate { worker } = message {
                info!(%worker, "terminated");
                return Ok(());
            }
            self.handle(message).await?;
        }
    }

    /// Handles one message from the primary. Invocations are spawned and
    /// run to completion on their own.
    pub async fn handle(&self, message: Message) -> Result<()> {
        match message {
            Message::Create { worker, settings, credential } => {
                *self.inner.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
                self.inner.settings.replace_all(settings);
                if credential.is_some() {
                    self.inner.settings.set_credential(credential);
                }
                info!(%worker, "created");
                self.send(&Message::WorkerReady { worker }).await
            }
            Message::Invoke(invoke) => {
                let host = self.clone();
                tokio::spawn(async move { host.run(invoke).await });
                Ok(())
            }
            Message::Credential { credential } => {
                debug!("credential replaced");
                self.inner.settings.set_credential(Some(credential));
                Ok(())
            }
            Message::CredentialRefreshResponse { secret } => {
                debug!("refreshed secret arrived");
                self.inner.refresh.offer(secret);
                Ok(())
            }
            other => {
                warn!(command = other.command(), "unexpected message on worker; dropping");
                Ok(())
            }
        }
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let payload = message.encode()?;
        self.inner.transport.send(ContextId::Primary, &payload).await?;
        Ok(())
    }

    /// Runs one invocation and sends its terminal message.
    async fn run(self, invoke: InvokeMessage) {
        let id = invoke.invocation;
        let envelope = invoke.envelope.clone();

        let reply = match self.execute(invoke).await {
            Ok(value) => Message::Result(ResultMessage {
                invocation: id,
                envelope,
                value: value.to_string(),
            }),
            Err(e) => {
                warn!(invocation = %id, envelope = %envelope, error = %format!("{:#}", e), "invocation failed");
                Message::Error(ErrorMessage::call(id, envelope, format!("{:#}", e)))
            }
        };

        if let Err(e) = self.send(&reply).await {
            error!(invocation = %id, error = %e, "terminal message could not be sent");
        }
    }

    async fn execute(&self, invoke: InvokeMessage) -> anyhow::Result<Value> {
        let worker = self.worker().ok_or(Error::WorkerNotCreated)?;
        if worker != invoke.worker {
            warn!(expected = %worker, received = %invoke.worker, "invocation addressed to another worker");
        }

        let service = self
            .inner
            .services
            .get(&invoke.envelope.contract)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::ServiceNotFound(invoke.envelope.contract.clone()))?;

        let call = Invocation {
            id: invoke.invocation,
            worker,
            envelope: invoke.envelope,
            events: invoke.events,
            upload_context: invoke.upload_context,
            host: self.clone(),
        };
        debug!(invocation = %call.id, envelope = %call.envelope, "executing");

        match service.call(&call).await {
            Err(e) if is_credential_expired(&e) => {
                let request = Message::CredentialRefreshRequest { worker };
                self.inner.refresh.recover(e, self.send(&request), || service.call(&call)).await
            }
            outcome => outcome,
        }
    }
}

fn is_credential_expired(error: &anyhow::Error) -> bool {
    error.downcast_ref::<Error>().is_some_and(Error::is_credential_expired)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::transport::Switchboard;

    fn invocation(params: &[(&str, TypeName, Value)]) -> Invocation {
        let board = Switchboard::new();
        let host = Host::builder(board.attach(ContextId::Worker(WorkerId(1)))).build();
        let mut envelope = Envelope::new(ContractId::new("ICalculator"), "Add", TypeName::of::<i32>());
        for (name, type_name, value) in params {
            envelope.add_parameter(*name, type_name.clone(), value.clone()).unwrap();
        }
        Invocation {
            id: InvocationId(1),
            worker: WorkerId(1),
            envelope,
            events: BTreeMap::new(),
            upload_context: None,
            host,
        }
    }

    #[test]
    fn arguments_follow_their_declared_type() {
        let call = invocation(&[
            ("a", TypeName::of::<i32>(), json!("42")),
            ("label", TypeName::of::<String>(), json!("42")),
            ("b", TypeName::of::<i32>(), json!("many")),
            ("c", TypeName::of::<Vec<u8>>(), json!("[1, 2]")),
        ]);

        assert_eq!(call.arg_value("a").unwrap(), json!(42));
        assert_eq!(call.arg::<i32>("a").unwrap(), 42);
        assert_eq!(call.arg_value("label").unwrap(), json!("42"));
        assert_eq!(call.arg::<String>("label").unwrap(), "42");
        assert_eq!(call.arg_value("b").unwrap(), json!("many"));
        assert!(call.arg::<i32>("b").is_err());
        assert_eq!(call.arg_value("c").unwrap(), json!("[1, 2]"));
        assert!(matches!(call.arg::<i32>("missing"), Err(Error::MissingArgument { .. })));
    }

    #[test]
    fn credential_expiry_survives_anyhow() {
        let expired: anyhow::Error = Error::CredentialExpired("token".into()).into();
        assert!(is_credential_expired(&expired));

        let other: anyhow::Error = Error::Remote("boom".into()).into();
        assert!(!is_credential_expired(&other));
        assert!(!is_credential_expired(&anyhow::anyhow!("plain")));
    }
}
