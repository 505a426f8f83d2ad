//! Credential refresh across the channel: the worker's call fails with an
//! expired credential, the primary supplies a fresh secret, and the call is
//! replayed once.

mod common;

use std::time::Duration;

use common::Cluster;
use offrpc::Credential;
use offrun::Contract;
use offrun::Error;
use offrun::RefreshPolicy;
use offrun::Settings;
use offrun::settings::REFRESH_POLL_KEY;
use offrun::settings::REFRESH_TIMEOUT_KEY;
use tokio::sync::oneshot;

fn primary_settings(secret: Option<&str>) -> Settings {
    let settings = Settings::from_pairs([(REFRESH_POLL_KEY, "5"), (REFRESH_TIMEOUT_KEY, "150")]);
    settings.set_credential(secret.map(|secret| {
        let mut credential = Credential::new(secret);
        credential.realm = "contoso".into();
        credential
    }));
    settings
}

// --- Test 1: Replayed With the Fresh Secret ---

#[tokio::test]
async fn test_refresh_replays_once_with_the_new_secret() {
    let cluster = Cluster::start(primary_settings(Some("newtoken"))).await;
    cluster.host.settings().replace_secret("stale");
    let calc = cluster.calculator();

    let who = calc.whoami().await.unwrap();

    assert_eq!(who, "newtoken");
    assert_eq!(cluster.whoami_attempts(), 2);
    let credential = cluster.host.settings().credential().unwrap();
    assert_eq!(credential.secret, "newtoken");
    assert_eq!(credential.realm, "contoso");
    assert!(!cluster.host.refresh().is_filled());
}

// --- Test 2: Timeout Surfaces the Original Failure ---

#[tokio::test]
async fn test_refresh_timeout_delivers_the_original_error() {
    let cluster = Cluster::start(primary_settings(None)).await;
    let calc = cluster.calculator();

    let (tx, rx) = oneshot::channel();
    cluster
        .dispatcher
        .register_callbacks(
            calc.stand_in(),
            "Whoami",
            |_: String| -> anyhow::Result<()> { anyhow::bail!("no secret should come back") },
            move |e: &Error| {
                let _ = tx.send(e.to_string());
                Ok(())
            },
        )
        .unwrap();

    let pending = calc.whoami();
    let error = rx.await.unwrap();

    assert_eq!(error, "Remote failure: Credential expired: '' is stale");
    assert!(matches!(pending.await, Err(Error::Remote(_))));
    assert_eq!(cluster.whoami_attempts(), 1);
}

// --- Test 3: Policy Read From the Create Message ---

#[tokio::test]
async fn test_refresh_policy_follows_primary_settings() {
    let cluster = Cluster::start(primary_settings(None)).await;

    let policy = cluster.host.refresh().policy();
    assert_eq!(policy.poll_interval(), Duration::from_millis(5));
    assert_eq!(policy.timeout(), Duration::from_millis(150));
}

// --- Test 4: A Fixed Policy Wins ---

#[tokio::test]
async fn test_fixed_refresh_policy() {
    let fixed = RefreshPolicy::new(Duration::from_millis(1), Duration::from_millis(20));
    let cluster = Cluster::start_with(primary_settings(None), |host| host.refresh_policy(fixed)).await;
    let calc = cluster.calculator();

    let started = tokio::time::Instant::now();
    assert!(calc.whoami().await.is_err());
    assert!(started.elapsed() < Duration::from_millis(150));
    assert_eq!(cluster.host.refresh().policy(), fixed);
}

// --- Test 5: Pushed Credentials Avoid the Refresh ---

#[tokio::test]
async fn test_pushed_credential_is_used() {
    let cluster = Cluster::start(primary_settings(Some("stale"))).await;
    cluster.dispatcher.settings().replace_secret("newtoken");
    assert!(cluster.dispatcher.send_credential(common::WORKER).unwrap());
    let calc = cluster.calculator();

    assert_eq!(calc.whoami().await.unwrap(), "newtoken");
    assert_eq!(cluster.whoami_attempts(), 1);
}

// --- Test 6: Overlapping Refreshes ---

#[tokio::test]
async fn test_overlapping_refreshes_both_replay() {
    let cluster = Cluster::start(primary_settings(Some("newtoken"))).await;
    cluster.host.settings().replace_secret("stale");
    let calc = cluster.calculator();

    let (first, second) = tokio::join!(calc.whoami(), calc.whoami());

    assert_eq!(first.unwrap(), "newtoken");
    assert_eq!(second.unwrap(), "newtoken");
    assert!((3..=4).contains(&cluster.whoami_attempts()));
    assert_eq!(cluster.dispatcher.pending_invocations(), 0);
}
