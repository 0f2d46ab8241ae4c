//! Authentication lifecycle tests

mod common;

use common::*;
use edgelink_client::{MfaPrompt, OverlayError};
use edgelink_proto::{AuthQuery, MfaProvider};
use edgelink_transport::DialOptions;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn test_authenticate_loads_services_and_emits_full() {
    let control = MockControl::new();
    control.set_services(vec![service("svc1", "web")]);
    let net = MockNet::new();
    let client = test_client(control.clone(), net);

    let full_events = Arc::new(AtomicUsize::new(0));
    let counter = full_events.clone();
    let _sub = client.events().auth_state_full.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    client.authenticate().await.unwrap();

    assert!(client.auth_state().is_full());
    assert_eq!(full_events.load(Ordering::SeqCst), 1);
    assert!(client.get_service("web").await.unwrap().is_some());
    assert_eq!(control.authenticate_calls.load(Ordering::SeqCst), 1);

    client.close().await;
}

#[tokio::test]
async fn test_second_authenticate_refreshes_in_place() {
    let control = MockControl::new();
    let net = MockNet::new();
    let client = test_client(control.clone(), net);

    client.authenticate().await.unwrap();
    let refreshes = control.refresh_calls.load(Ordering::SeqCst);

    client.authenticate().await.unwrap();

    // the existing api session was refreshed, not replaced
    assert_eq!(control.authenticate_calls.load(Ordering::SeqCst), 1);
    assert!(control.refresh_calls.load(Ordering::SeqCst) > refreshes);

    client.close().await;
}

#[tokio::test]
async fn test_failed_refresh_falls_back_to_full_auth() {
    let control = MockControl::new();
    let net = MockNet::new();
    let client = test_client(control.clone(), net);

    client.authenticate().await.unwrap();

    let unauth_events = Arc::new(AtomicUsize::new(0));
    let counter = unauth_events.clone();
    let _sub = client
        .events()
        .auth_state_unauthenticated
        .subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    control.set_fail_refresh(true);
    client.authenticate().await.unwrap();

    // the dead session was announced before the replacement was established
    assert_eq!(unauth_events.load(Ordering::SeqCst), 1);
    assert_eq!(control.authenticate_calls.load(Ordering::SeqCst), 2);
    assert!(client.auth_state().is_full());

    client.close().await;
}

#[tokio::test]
async fn test_partial_auth_totp_flow() {
    let control = MockControl::new();
    control.set_auth_queries(vec![AuthQuery {
        provider: MfaProvider::Totp,
        type_id: "totp".to_string(),
    }]);
    let net = MockNet::new();
    let client = test_client(control.clone(), net);

    let prompt_slot: Arc<Mutex<Option<MfaPrompt>>> = Arc::new(Mutex::new(None));
    let slot = prompt_slot.clone();
    let _sub = client.events().mfa_totp_code.subscribe(move |prompt| {
        *slot.lock().unwrap() = Some(prompt.clone());
    });

    let full_events = Arc::new(AtomicUsize::new(0));
    let counter = full_events.clone();
    let _full = client.events().auth_state_full.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    client.authenticate().await.unwrap();
    assert!(!client.auth_state().is_full());

    let prompt = prompt_slot
        .lock()
        .unwrap()
        .take()
        .expect("totp prompt raised");
    prompt.responder.submit("123456").await.unwrap();

    assert!(client.auth_state().is_full());
    assert_eq!(full_events.load(Ordering::SeqCst), 1);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_session_create_backoff_respects_budget() {
    let control = MockControl::new();
    control.set_services(vec![service("svc1", "web")]);
    let net = MockNet::new();
    let client = test_client(control.clone(), net);
    client.authenticate().await.unwrap();

    control.set_fail_create(true);
    let options = DialOptions {
        connect_timeout: Duration::from_millis(200),
        ..DialOptions::default()
    };

    let start = tokio::time::Instant::now();
    let err = client.dial_with_options("web", options).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, OverlayError::Dial(_)), "got {err}");
    assert!(
        elapsed <= Duration::from_millis(400),
        "backoff overshot its budget: {elapsed:?}"
    );
    assert!(control.create_calls.load(Ordering::SeqCst) >= 2);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_session_create_triggers_reauth() {
    let control = MockControl::new();
    control.set_services(vec![service("svc1", "web")]);
    let net = MockNet::new();
    let client = test_client(control.clone(), net);
    client.authenticate().await.unwrap();

    control.set_create_unauthorized(true);
    control.set_fail_refresh(true);

    let options = DialOptions {
        connect_timeout: Duration::from_millis(200),
        ..DialOptions::default()
    };
    let err = client.dial_with_options("web", options).await.unwrap_err();

    assert!(matches!(err, OverlayError::Dial(_)));
    // the unauthorized create forced a fresh authentication attempt
    assert!(control.authenticate_calls.load(Ordering::SeqCst) >= 2);

    client.close().await;
}
