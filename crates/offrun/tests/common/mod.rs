//! A calculator contract served by a worker host over a switchboard.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use offrpc::ContextId;
use offrpc::WorkerId;
use offrun::Contract;
use offrun::Declaration;
use offrun::Dispatcher;
use offrun::Error;
use offrun::Host;
use offrun::Invocation;
use offrun::Method;
use offrun::Pending;
use offrun::Service;
use offrun::Settings;
use offrun::StandIn;
use offrun::Switchboard;
use serde_json::Value;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub const WORKER: WorkerId = WorkerId(1);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Calculator {
    stand_in: StandIn,
}

impl Contract for Calculator {
    fn declare() -> Declaration {
        Declaration::new("ICalculator")
            .method(Method::new("Add").param::<i32>("a").param::<i32>("b").returns::<i32>())
            .method(Method::new("Divide").param::<f64>("a").param::<f64>("b").deferred_value::<f64>())
            .method(Method::new("Count").param::<u32>("to").returns::<u32>())
            .method(Method::new("Echo").generic("T").generic_param("value", "T").deferred_generic("T"))
            .method(Method::new("Whoami").deferred_value::<String>())
            .method(Method::new("Stall").deferred())
            .event::<u32>("Progress")
    }

    fn bind(stand_in: StandIn) -> Self {
        Self { stand_in }
    }

    fn stand_in(&self) -> &StandIn {
        &self.stand_in
    }
}

impl Calculator {
    pub fn add(&self, a: i32, b: i32) -> i32 {
        self.stand_in.method("Add").arg(&a).arg(&b).call_value()
    }

    pub fn divide(&self, a: f64, b: f64) -> Pending<f64> {
        self.stand_in.method("Divide").arg(&a).arg(&b).call_async_value()
    }

    pub fn count(&self, to: u32) -> u32 {
        self.stand_in.method("Count").arg(&to).call_value()
    }

    pub fn echo<T>(&self, value: &T) -> Pending<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
    {
        self.stand_in.method("Echo").generic::<T>().arg(value).call_async_value()
    }

    pub fn whoami(&self) -> Pending<String> {
        self.stand_in.method("Whoami").call_async_value()
    }

    pub fn stall(&self) -> Pending<()> {
        self.stand_in.method("Stall").call_async()
    }
}

/// A contract the worker has no service for.
pub struct Missing(StandIn);

impl Contract for Missing {
    fn declare() -> Declaration {
        Declaration::new("IMissing").method(Method::new("Anything").deferred())
    }

    fn bind(stand_in: StandIn) -> Self {
        Self(stand_in)
    }

    fn stand_in(&self) -> &StandIn {
        &self.0
    }
}

/// The real calculator. `Whoami` only accepts the secret `newtoken`.
#[derive(Default)]
pub struct CalculatorService {
    pub whoami_attempts: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Service for CalculatorService {
    async fn call(&self, call: &Invocation) -> anyhow::Result<Value> {
        match call.method() {
            "Add" => {
                let a: i32 = call.arg("a")?;
                let b: i32 = call.arg("b")?;
                Ok(json!(a + b))
            }
            "Divide" => {
                let a: f64 = call.arg("a")?;
                let b: f64 = call.arg("b")?;
                if b == 0.0 {
                    anyhow::bail!("division by zero");
                }
                Ok(json!(a / b))
            }
            "Count" => {
                let to: u32 = call.arg("to")?;
                for step in 1..=to {
                    call.emit("Progress", &step).await?;
                }
                Ok(json!(to))
            }
            "Echo" => {
                Ok(call.arg_value("value")?)
            }
            "Whoami" => {
                self.whoami_attempts.fetch_add(1, Ordering::SeqCst);
                let secret = call.credential().unwrap_or_default().secret;
                if secret != "newtoken" {
                    return Err(Error::CredentialExpired(format!("'{}' is stale", secret)).into());
                }
                Ok(json!(secret))
            }
            "Stall" => {
                futures::future::pending::<()>().await;
                Ok(Value::Null)
            }
            other => anyhow::bail!("no such method: {}", other),
        }
    }
}

/// A primary and one ready worker, each serving its end of a switchboard.
pub struct Cluster {
    pub board: Switchboard,
    pub dispatcher: Dispatcher,
    pub host: Host,
    pub pump: JoinHandle<Error>,
    pub hosting: JoinHandle<offrun::Result<()>>,
    pub whoami_attempts: Arc<AtomicUsize>,
}

impl Cluster {
    pub async fn start(settings: Settings) -> Self {
        Self::start_with(settings, |builder| builder).await
    }

    /// Like [`start`](Self::start), letting the test adjust the host first.
    pub async fn start_with(
        settings: Settings,
        configure: impl FnOnce(offrun::HostBuilder) -> offrun::HostBuilder,
    ) -> Self {
        init_tracing();
        let board = Switchboard::new();
        let primary = board.attach(ContextId::Primary);
        let worker = board.attach(ContextId::Worker(WORKER));

        let service = CalculatorService::default();
        let whoami_attempts = service.whoami_attempts.clone();
        let host = configure(Host::builder(worker).service("ICalculator", service)).build();
        let hosting = {
            let host = host.clone();
            tokio::spawn(async move { host.serve().await })
        };

        let dispatcher = Dispatcher::builder(primary).settings(Arc::new(settings)).build().unwrap();
        let pump = dispatcher.spawn_pump();

        let (ready_tx, ready_rx) = oneshot::channel();
        dispatcher
            .create_worker_with(Some(WORKER), move |worker| {
                let _ = ready_tx.send(worker);
                Ok(())
            })
            .unwrap();
        assert_eq!(ready_rx.await.unwrap(), WORKER);

        Self {
            board,
            dispatcher,
            host,
            pump,
            hosting,
            whoami_attempts,
        }
    }

    pub fn calculator(&self) -> Calculator {
        self.dispatcher.proxy(WORKER, None).unwrap()
    }

    pub fn whoami_attempts(&self) -> usize {
        self.whoami_attempts.load(Ordering::SeqCst)
    }
}
