//! End-to-end sign-in, sign-up, and restore flows against a local server.

mod support;

use auth_session::{AuthController, AuthError, AuthState, Config};
use connectivity_monitor::ConnectivityMonitor;
use credential_vault::{FileStore, MemoryStore};
use std::sync::{Arc, Mutex};
use support::{auth_payload, Handler, Resp, TestServer};

fn test_config(url: &str) -> Config {
    Config {
        api_url: url.to_string(),
        ..Config::default()
    }
}

fn new_controller(url: &str) -> Arc<AuthController> {
    let monitor = ConnectivityMonitor::new(true);
    AuthController::new(&test_config(url), Box::new(MemoryStore::new()), monitor)
        .expect("controller")
}

fn happy_handler() -> Handler {
    Arc::new(|req| match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/auth/login") => Resp::json(200, auth_payload("poet", "acc-1", "ref-1", 3600)),
        ("POST", "/auth/register") => Resp::json(200, auth_payload("newpoet", "acc-2", "ref-2", 3600)),
        ("GET", "/auth/me") if req.bearer.as_deref() == Some("acc-1") => Resp::json(
            200,
            serde_json::json!({
                "user": {
                    "id": "poet",
                    "email": "poet@example.com",
                    "username": "poet",
                    "isAnonymousAccount": false
                }
            }),
        ),
        _ => Resp::json(401, serde_json::json!({"error": "unauthorized"})),
    })
}

#[tokio::test]
async fn sign_in_then_current_user_without_refresh() {
    let server = TestServer::start(happy_handler()).await;
    let controller = new_controller(&server.url());

    let user = controller.sign_in("poet@example.com", "hunter2").await.unwrap();
    assert_eq!(user.id, "poet");
    assert_eq!(controller.state(), AuthState::Authenticated);

    let fetched = controller.current_user().await.unwrap().unwrap();
    assert_eq!(fetched.username, "poet");

    // A fresh access token must not trigger any refresh traffic
    assert_eq!(server.hits_for("/auth/refresh"), 0);
    assert_eq!(server.hits_for("/auth/me"), 1);
}

#[tokio::test]
async fn rejected_login_is_not_retried() {
    let server = TestServer::start(Arc::new(|_req| {
        Resp::json(401, serde_json::json!({"error": "bad credentials"}))
    }))
    .await;
    let controller = new_controller(&server.url());

    let err = controller
        .sign_in("poet@example.com", "wrong")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Terminal { status: 401, .. }));
    assert_eq!(controller.state(), AuthState::Error);

    // Exactly one request: bad credentials are terminal, and a login 401
    // must never be mistaken for a stale access token
    assert_eq!(server.hits_for("/auth/login"), 1);
    assert_eq!(server.hits_for("/auth/refresh"), 0);
}

#[tokio::test]
async fn sign_up_signs_the_new_account_in() {
    let server = TestServer::start(happy_handler()).await;
    let controller = new_controller(&server.url());

    let user = controller
        .sign_up("newpoet@example.com", "newpoet", "hunter2")
        .await
        .unwrap();
    assert_eq!(user.id, "newpoet");
    assert_eq!(controller.state(), AuthState::Authenticated);
}

#[tokio::test]
async fn anonymous_sign_in_stores_minted_credentials() {
    let server = TestServer::start(Arc::new(|req| {
        match (req.method.as_str(), req.path.as_str()) {
            ("POST", "/auth/anonymous") => {
                let mut payload = auth_payload("ghost", "acc-anon", "ref-anon", 3600);
                payload["user"]["isAnonymousAccount"] = serde_json::json!(true);
                Resp::json(200, payload)
            }
            _ => Resp::json(404, serde_json::json!({"error": "not found"})),
        }
    }))
    .await;
    let controller = new_controller(&server.url());

    let user = controller.sign_in_anonymous().await.unwrap();
    assert!(user.is_anonymous_account);
    assert_eq!(controller.state(), AuthState::Authenticated);

    let snapshot = controller.snapshot();
    assert!(snapshot.user.unwrap().is_anonymous_account);
}

#[tokio::test]
async fn state_listener_sees_the_attempt_lifecycle() {
    let server = TestServer::start(happy_handler()).await;
    let controller = new_controller(&server.url());

    let seen: Arc<Mutex<Vec<AuthState>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    controller.on_state_change(Box::new(move |snapshot| {
        seen2.lock().unwrap().push(snapshot.state);
    }));

    controller.sign_in("poet@example.com", "hunter2").await.unwrap();

    let states = seen.lock().unwrap().clone();
    assert_eq!(
        states,
        vec![AuthState::Authenticating, AuthState::Authenticated]
    );
}

#[tokio::test]
async fn concurrent_attempt_is_rejected_while_authenticating() {
    let server = TestServer::start(Arc::new(|req| {
        match (req.method.as_str(), req.path.as_str()) {
            ("POST", "/auth/login") => {
                Resp::json(200, auth_payload("poet", "acc-1", "ref-1", 3600))
                    .with_delay(std::time::Duration::from_millis(300))
            }
            _ => Resp::json(404, serde_json::json!({"error": "not found"})),
        }
    }))
    .await;
    let controller = new_controller(&server.url());

    let first = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.sign_in("poet@example.com", "hunter2").await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let second = controller.sign_in("poet@example.com", "hunter2").await;
    assert!(matches!(second, Err(AuthError::InvalidStateTransition(_))));

    first.await.unwrap().unwrap();
    assert_eq!(controller.state(), AuthState::Authenticated);
}

#[tokio::test]
async fn session_restores_from_disk_across_controllers() {
    let server = TestServer::start(happy_handler()).await;
    let dir = tempfile::tempdir().unwrap();
    let vault_path = dir.path().join("vault.json");

    {
        let monitor = ConnectivityMonitor::new(true);
        let controller = AuthController::new(
            &test_config(&server.url()),
            Box::new(FileStore::open(&vault_path).unwrap()),
            monitor,
        )
        .unwrap();
        controller.sign_in("poet@example.com", "hunter2").await.unwrap();
    }

    let monitor = ConnectivityMonitor::new(true);
    let controller = AuthController::new(
        &test_config(&server.url()),
        Box::new(FileStore::open(&vault_path).unwrap()),
        monitor,
    )
    .unwrap();

    let snapshot = controller.restore_session().await.unwrap();
    assert_eq!(snapshot.state, AuthState::Authenticated);
    assert_eq!(snapshot.user.unwrap().id, "poet");
    // Token was still live, so restore is purely local
    assert_eq!(server.hits_for("/auth/refresh"), 0);
}

#[tokio::test]
async fn invalid_api_url_is_rejected_at_construction() {
    let monitor = ConnectivityMonitor::new(true);
    let err = AuthController::new(
        &test_config("not a url"),
        Box::new(MemoryStore::new()),
        monitor,
    )
    .unwrap_err();
    assert!(matches!(err, AuthError::InvalidUrl(_)));
}

#[tokio::test]
async fn empty_tokens_in_auth_response_fail_the_attempt() {
    let server = TestServer::start(Arc::new(|_req| {
        let mut payload = auth_payload("poet", "acc-1", "ref-1", 3600);
        payload["accessToken"] = serde_json::json!("");
        Resp::json(200, payload)
    }))
    .await;
    let controller = new_controller(&server.url());

    let err = controller
        .sign_in("poet@example.com", "hunter2")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::MalformedResponse(_)));
    assert_eq!(controller.state(), AuthState::Error);
    // Nothing was persisted for the broken session
    assert_eq!(controller.current_user().await.unwrap(), None);
}

#[tokio::test]
async fn sign_out_recovers_from_the_error_state() {
    let server = TestServer::start(Arc::new(|_req| {
        Resp::json(401, serde_json::json!({"error": "bad credentials"}))
    }))
    .await;
    let controller = new_controller(&server.url());

    controller
        .sign_in("poet@example.com", "wrong")
        .await
        .unwrap_err();
    assert_eq!(controller.state(), AuthState::Error);

    controller.sign_out().await.unwrap();
    assert_eq!(controller.state(), AuthState::AnonymousVisitor);
}
