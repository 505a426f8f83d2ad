//! The value handed back by deferred stand-in methods.

use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use futures::FutureExt;
use futures::future::BoxFuture;
use offrpc::Codec;
use offrpc::InvocationId;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::error::Result;
use crate::registry::Outcome;

/// Resolves once the invocation's terminal message arrives: with the
/// decoded value, with the remote error, or with `Abandoned` when the worker
/// or the pump went away first.
#[must_use = "a pending value does nothing unless awaited"]
pub struct Pending<T> {
    invocation: InvocationId,
    future: BoxFuture<'static, Result<T>>,
}

impl<T: DeserializeOwned + Send + 'static> Pending<T> {
    pub(crate) fn new(invocation: InvocationId, rx: oneshot::Receiver<Outcome>, codec: Codec) -> Self {
        let future = async move {
            match rx.await {
                Ok(Ok(raw)) => Ok(codec.decode::<T>(&raw)?),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::Abandoned(invocation)),
            }
        };
        Self {
            invocation,
            future: future.boxed(),
        }
    }
}

impl<T> Pending<T> {
    pub fn invocation(&self) -> InvocationId {
        self.invocation
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().future.as_mut().poll(cx)
    }
}
