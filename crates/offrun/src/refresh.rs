//! # Credential Refresh Coordinator
//!
//! Recovers an invocation that failed because the worker's credential
//! expired: ask the primary for a fresh secret, wait for it, and replay the
//! invocation once.
//!
//! ## Protocol
//!
//! 1. Take the next request generation. Secrets offered before it are stale.
//! 2. Send the refresh request.
//! 3. Poll the slot every `poll_interval` until it holds a secret of this
//!    generation or a later one, or until `timeout` passes. Polling sleeps
//!    cooperatively, so only the failed invocation waits.
//! 4. On timeout, the original failure is the outcome.
//! 5. Otherwise the secret replaces the one in the settings store and the
//!    invocation is replayed exactly once. Its outcome is final.
//! 6. On the way out the slot is cleared, unless it already holds a secret
//!    newer than the one this invocation consumed.
//!
//! Several invocations may be recovering at once. A secret answers every
//! waiter whose request went out before it arrived.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::settings::RefreshPolicy;
use crate::settings::Settings;

#[derive(Default)]
struct Slot {
    /// Generation of the latest refresh request.
    requested: u64,
    /// The last secret offered, stamped with the generation it answers.
    secret: Option<(u64, String)>,
}

pub struct RefreshCoordinator {
    slot: Mutex<Slot>,
    settings: Arc<Settings>,
    policy: Option<RefreshPolicy>,
}

/// Clears the slot when dropped, if it still holds the consumed generation.
struct ClearOnDrop<'a> {
    refresh: &'a RefreshCoordinator,
    consumed: Option<u64>,
}

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.consumed {
            self.refresh.clear(generation);
        }
    }
}

impl RefreshCoordinator {
    /// Without a fixed `policy`, the policy is read from `settings` each
    /// time a refresh starts.
    pub fn new(settings: Arc<Settings>, policy: Option<RefreshPolicy>) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            settings,
            policy,
        }
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy.unwrap_or_else(|| RefreshPolicy::from_settings(&self.settings))
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands over a refreshed secret. It answers every request made so far.
    pub fn offer(&self, secret: String) {
        let mut slot = self.lock();
        slot.secret = Some((slot.requested, secret));
    }

    pub fn is_filled(&self) -> bool {
        self.lock().secret.is_some()
    }

    fn begin(&self) -> u64 {
        let mut slot = self.lock();
        slot.requested += 1;
        slot.requested
    }

    /// The secret answering request `generation`, with the generation it
    /// was stamped with.
    fn peek(&self, generation: u64) -> Option<(u64, String)> {
        self.lock().secret.clone().filter(|(stamp, _)| *stamp >= generation)
    }

    fn clear(&self, generation: u64) {
        let mut slot = self.lock();
        if slot.secret.as_ref().is_some_and(|(stamp, _)| *stamp == generation) {
            slot.secret = None;
        }
    }

    /// Runs the refresh protocol for `failure`.
    ///
    /// `request` sends the refresh request; `retry` replays the invocation.
    pub async fn recover<T, E, Req, Retry, Fut>(&self, failure: E, request: Req, retry: Retry) -> std::result::Result<T, E>
    where
        E: Display,
        Req: Future<Output = Result<()>>,
        Retry: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut guard = ClearOnDrop {
            refresh: self,
            consumed: None,
        };
        let generation = self.begin();

        let policy = self.policy();
        info!(error = %failure, generation, timeout_ms = policy.timeout().as_millis() as u64, "credential expired, requesting refresh");
        if let Err(e) = request.await {
            warn!(error = %e, original = %failure, "could not request credential refresh");
            return Err(failure);
        }

        let started = Instant::now();
        let (stamp, secret) = loop {
            if let Some(found) = self.peek(generation) {
                break found;
            }
            if started.elapsed() >= policy.timeout() {
                warn!(error = %failure, generation, "credential refresh timed out");
                return Err(failure);
            }
            tokio::time::sleep(policy.poll_interval()).await;
        };
        guard.consumed = Some(stamp);
        debug!(generation, stamp, "refreshed secret taken");

        self.settings.replace_secret(secret);
        info!("credential refreshed, replaying invocation");
        retry().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use offrpc::Credential;

    use crate::error::Error;

    use super::*;

    fn coordinator(settings: &Arc<Settings>) -> Arc<RefreshCoordinator> {
        let policy = RefreshPolicy::new(Duration::from_millis(5), Duration::from_millis(200));
        Arc::new(RefreshCoordinator::new(settings.clone(), Some(policy)))
    }

    #[tokio::test]
    async fn replays_once_with_the_fresh_secret() {
        let settings = Arc::new(Settings::new());
        let mut credential = Credential::new("stale");
        credential.realm = "contoso".into();
        settings.set_credential(Some(credential));
        let refresh = coordinator(&settings);
        let attempts = AtomicUsize::new(0);

        let responder = refresh.clone();
        let request = async move {
            responder.offer("newtoken".into());
            Ok::<_, Error>(())
        };
        let outcome: std::result::Result<&str, String> = refresh
            .recover("expired".to_string(), request, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("done")
            })
            .await;

        assert_eq!(outcome.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let current = settings.credential().unwrap();
        assert_eq!(current.secret, "newtoken");
        assert_eq!(current.realm, "contoso");
        assert!(!refresh.is_filled());
    }

    #[tokio::test]
    async fn timeout_surfaces_the_original_failure() {
        let settings = Arc::new(Settings::new());
        let refresh = coordinator(&settings);
        let attempts = AtomicUsize::new(0);

        let outcome: std::result::Result<(), String> = refresh
            .recover("expired".to_string(), async { Ok::<_, Error>(()) }, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        assert_eq!(outcome.unwrap_err(), "expired");
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert!(settings.credential().is_none());
    }

    #[tokio::test]
    async fn a_failed_replay_is_final() {
        let settings = Arc::new(Settings::new());
        let refresh = coordinator(&settings);
        let responder = refresh.clone();
        let attempts = AtomicUsize::new(0);

        let outcome: std::result::Result<(), String> = refresh
            .recover(
                "expired".to_string(),
                async move {
                    responder.offer("fresh".into());
                    Ok::<_, Error>(())
                },
                || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("expired again".to_string())
                },
            )
            .await;

        assert_eq!(outcome.unwrap_err(), "expired again");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!refresh.is_filled());
    }

    #[tokio::test]
    async fn stale_secrets_are_cleared_before_requesting() {
        let settings = Arc::new(Settings::new());
        let refresh = coordinator(&settings);
        refresh.offer("left over".into());

        let outcome: std::result::Result<(), String> = refresh
            .recover("expired".to_string(), async { Ok::<_, Error>(()) }, || async { Ok::<_, String>(()) })
            .await;

        assert_eq!(outcome.unwrap_err(), "expired");
        assert!(settings.credential().is_none());
    }

    #[tokio::test]
    async fn overlapping_recoveries_each_get_their_secret() {
        let settings = Arc::new(Settings::new());
        let policy = RefreshPolicy::new(Duration::from_millis(50), Duration::from_millis(400));
        let refresh = Arc::new(RefreshCoordinator::new(settings.clone(), Some(policy)));

        let first = {
            let responder = refresh.clone();
            let refresh = refresh.clone();
            async move {
                refresh
                    .recover(
                        "expired A".to_string(),
                        async move {
                            responder.offer("secret A".into());
                            Ok::<_, Error>(())
                        },
                        || async {
                            tokio::time::sleep(Duration::from_millis(40)).await;
                            Ok::<_, String>("A done")
                        },
                    )
                    .await
            }
        };
        let second = {
            let responder = refresh.clone();
            let refresh = refresh.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let request = async move {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        responder.offer("secret B".into());
                    });
                    Ok::<_, Error>(())
                };
                refresh
                    .recover("expired B".to_string(), request, || async { Ok::<_, String>("B done") })
                    .await
            }
        };

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a, Ok("A done"));
        assert_eq!(b, Ok("B done"));
        assert_eq!(settings.credential().unwrap().secret, "secret B");
        assert!(!refresh.is_filled());
    }
}
