use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use langleague_core::api::{ApiError, ApiRequest, AuthenticatedTransport, EmptyOnUnreachable};
use langleague_core::auth::{CredentialStore, MemoryStore};
use langleague_core::TransportConfig;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Nothing listens here; connections are refused immediately.
const UNREACHABLE: &str = "http://127.0.0.1:1";

struct Harness {
    transport: AuthenticatedTransport,
    store: Arc<MemoryStore>,
    unauthenticated: Arc<AtomicUsize>,
}

impl Harness {
    fn unauthenticated(&self) -> usize {
        self.unauthenticated.load(Ordering::SeqCst)
    }
}

fn config_for(base_url: &str) -> TransportConfig {
    let mut config = TransportConfig::new(base_url);
    config.initial_backoff = Duration::from_millis(10);
    config
}

fn harness_with(config: TransportConfig, token: Option<&str>) -> Harness {
    let store = Arc::new(match token {
        Some(token) => MemoryStore::with_entry("authToken", token),
        None => MemoryStore::new(),
    });
    let unauthenticated = Arc::new(AtomicUsize::new(0));
    let counter = unauthenticated.clone();

    let transport = AuthenticatedTransport::builder(config)
        .shared_credentials(store.clone())
        .on_unauthenticated(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .expect("transport");

    Harness {
        transport,
        store,
        unauthenticated,
    }
}

fn harness(server: &MockServer, token: Option<&str>) -> Harness {
    harness_with(config_for(&server.uri()), token)
}

async fn hits(server: &MockServer, route: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == route)
        .count()
}

/// 401 for the first `failures` calls, 200 afterwards.
fn unauthorized_then_ok(failures: usize) -> impl Fn(&Request) -> ResponseTemplate {
    let calls = Arc::new(AtomicUsize::new(0));
    move |_req: &Request| {
        if calls.fetch_add(1, Ordering::SeqCst) < failures {
            ResponseTemplate::new(401)
        } else {
            ResponseTemplate::new(200).set_body_json(serde_json::json!(["unit-1"]))
        }
    }
}

fn bearer(request: &Request) -> Option<String> {
    request
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ===== Request hook =====

#[tokio::test]
async fn attaches_token_except_on_auth_and_register_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/books"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let h = harness(&server, Some("jwt-1"));
    h.transport.get("/api/books").await.unwrap();
    h.transport
        .post("/api/register", &serde_json::json!({"login": "ana"}))
        .await
        .unwrap();
    h.transport
        .post("/api/authenticate", &serde_json::json!({"username": "ana"}))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    for request in &requests {
        match request.url.path() {
            "/api/books" => assert_eq!(bearer(request).as_deref(), Some("Bearer jwt-1")),
            other => assert_eq!(bearer(request), None, "{other} carried a token"),
        }
    }
}

#[tokio::test]
async fn omits_token_when_store_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;

    let h = harness(&server, None);
    h.transport.get("/api/books").await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(bearer(&requests[0]), None);
}

#[tokio::test]
async fn successful_responses_pass_through() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/units"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!(["unit-1"])))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, Some("jwt-1"));
    let units: Vec<String> = h.transport.get_json("/api/units").await.unwrap();

    assert_eq!(units, vec!["unit-1".to_string()]);
    assert!(!h.transport.is_revalidating());
    assert_eq!(h.unauthenticated(), 0);
}

// ===== Single-flight revalidation =====

#[tokio::test]
async fn concurrent_401s_share_one_revalidation() {
    const CALLERS: usize = 5;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/units"))
        .respond_with(unauthorized_then_ok(CALLERS))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/account"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"login": "ana"}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, Some("stale"));
    let results = join_all((0..CALLERS).map(|_| h.transport.get_json::<Vec<String>>("/api/units"))).await;

    for result in results {
        assert_eq!(result.unwrap(), vec!["unit-1".to_string()]);
    }
    assert_eq!(hits(&server, "/api/account").await, 1);
    assert_eq!(hits(&server, "/api/units").await, CALLERS * 2);
    assert_eq!(h.unauthenticated(), 0);
    assert!(!h.transport.is_revalidating());
}

#[tokio::test]
async fn two_components_recover_after_successful_revalidation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/units"))
        .respond_with(unauthorized_then_ok(2))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/account"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, Some("stale"));
    let (a, b) = tokio::join!(h.transport.get("/api/units"), h.transport.get("/api/units"));

    assert!(a.unwrap().status.is_success());
    assert!(b.unwrap().status.is_success());
    assert_eq!(h.unauthenticated(), 0);
    // Cookie-backed session survived, so the stored token is left alone.
    assert_eq!(h.store.get("authToken").unwrap().as_deref(), Some("stale"));
}

#[tokio::test]
async fn revalidation_network_failure_rejects_everyone_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/units"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/account"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let mut config = config_for(&server.uri());
    config.timeout = Duration::from_millis(300);
    let h = harness_with(config, Some("stale"));

    let (a, b) = tokio::join!(h.transport.get("/api/units"), h.transport.get("/api/units"));

    assert!(matches!(a, Err(ApiError::Timeout)));
    assert!(matches!(b, Err(ApiError::Timeout)));
    assert_eq!(h.unauthenticated(), 1);
    assert_eq!(hits(&server, "/api/account").await, 1);
    // Rejected waiters do not retry.
    assert_eq!(hits(&server, "/api/units").await, 2);
    assert_eq!(h.store.get("authToken").unwrap(), None);
}

#[tokio::test]
async fn unreachable_revalidation_counts_as_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/units"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config_for(&server.uri());
    config.account_path = format!("{UNREACHABLE}/api/account");
    let h = harness_with(config, Some("stale"));

    let err = h.transport.get("/api/units").await.unwrap_err();

    assert!(err.is_unreachable());
    assert_eq!(h.unauthenticated(), 1);
}

#[tokio::test]
async fn rejected_revalidation_propagates_its_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/units"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/account"))
        .respond_with(ResponseTemplate::new(500).set_body_string("db down"))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, Some("stale"));
    let err = h.transport.get("/api/units").await.unwrap_err();

    assert!(matches!(err, ApiError::ServerError(ref body) if body == "db down"));
    assert_eq!(h.unauthenticated(), 1);
}

#[tokio::test]
async fn refreshed_token_from_revalidation_is_stored_and_used() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/units"))
        .and(header("Authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/units"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/account"))
        .respond_with(ResponseTemplate::new(200).insert_header("Authorization", "Bearer fresh"))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, Some("stale"));
    h.transport.get("/api/units").await.unwrap();

    assert_eq!(h.store.get("authToken").unwrap().as_deref(), Some("fresh"));
    assert_eq!(h.unauthenticated(), 0);
}

// ===== Policies that skip revalidation =====

#[tokio::test]
async fn silent_request_never_invalidates_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/streaks/me"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/account"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(&server, Some("jwt-1"));
    let err = h
        .transport
        .send(ApiRequest::get("/api/streaks/me").silent())
        .await
        .unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(h.unauthenticated(), 0);
    assert_eq!(h.store.get("authToken").unwrap().as_deref(), Some("jwt-1"));

    let received = server.received_requests().await.unwrap();
    assert!(received[0].headers.contains_key("x-silent-request"));
}

#[tokio::test]
async fn silent_header_set_by_caller_is_honored() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/notifications"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let h = harness(&server, Some("jwt-1"));
    let request = ApiRequest::get("/api/notifications")
        .header("X-Silent-Request", "1")
        .unwrap();
    assert!(h.transport.send(request).await.is_err());

    assert_eq!(h.unauthenticated(), 0);
    assert_eq!(hits(&server, "/api/account").await, 0);
}

#[tokio::test]
async fn auth_check_401_invalidates_without_revalidating() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/account"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, Some("jwt-1"));
    let err = h.transport.get("/api/account").await.unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(h.unauthenticated(), 1);
    assert_eq!(h.store.get("authToken").unwrap(), None);
}

#[tokio::test]
async fn retried_request_is_not_retried_again() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/units"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/account"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, Some("jwt-1"));
    let err = h.transport.get("/api/units").await.unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(h.unauthenticated(), 0);
    assert!(!h.transport.is_revalidating());
}

#[tokio::test]
async fn request_already_marked_retried_goes_straight_to_caller() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/units"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, Some("jwt-1"));
    let mut request = ApiRequest::get("/api/units");
    request.context.retried = true;

    assert!(h.transport.send(request).await.unwrap_err().is_unauthorized());
    assert_eq!(hits(&server, "/api/account").await, 0);
    assert_eq!(h.unauthenticated(), 0);
}

#[tokio::test]
async fn forbidden_is_inert() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/books/7"))
        .respond_with(ResponseTemplate::new(403).set_body_string("staff only"))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, Some("jwt-1"));
    let err = h.transport.delete("/api/books/7").await.unwrap_err();

    assert!(matches!(err, ApiError::AccessDenied(ref body) if body == "staff only"));
    assert_eq!(h.unauthenticated(), 0);
    assert_eq!(hits(&server, "/api/account").await, 0);
    assert_eq!(h.store.get("authToken").unwrap().as_deref(), Some("jwt-1"));
}

#[tokio::test]
async fn other_errors_propagate_unchanged() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(409).set_body_string("version conflict"))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, Some("jwt-1"));
    let err = h
        .transport
        .put("/api/notes/3", &serde_json::json!({"text": "hi"}))
        .await
        .unwrap_err();

    assert_eq!(err.status().map(|s| s.as_u16()), Some(409));
    assert_eq!(h.unauthenticated(), 0);
}

// ===== Rate limiting =====

#[tokio::test]
async fn rate_limited_request_backs_off_then_succeeds() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    Mock::given(method("GET"))
        .respond_with(move |_req: &Request| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(429)
            } else {
                ResponseTemplate::new(200).set_body_json(serde_json::json!([]))
            }
        })
        .expect(2)
        .mount(&server)
        .await;

    let h = harness(&server, Some("jwt-1"));
    assert!(h.transport.get("/api/books").await.is_ok());
}

#[tokio::test]
async fn rate_limit_gives_up_after_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .expect(4)
        .mount(&server)
        .await;

    let h = harness(&server, Some("jwt-1"));
    assert!(matches!(h.transport.get("/api/books").await, Err(ApiError::RateLimited)));
}

// ===== Development fallback =====

#[tokio::test]
async fn dev_mode_masks_unreachable_backend() {
    let mut config = config_for(UNREACHABLE);
    config.dev_mode = true;
    let h = harness_with(config, None);

    let list = h.transport.get("/api/books").await.unwrap();
    assert!(list.synthetic);
    assert_eq!(list.json::<Vec<serde_json::Value>>().unwrap().len(), 0);

    let created = h
        .transport
        .post("/api/notes", &serde_json::json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(created.json::<serde_json::Value>().unwrap(), serde_json::Value::Null);
}

#[tokio::test]
async fn production_surfaces_unreachable_backend() {
    let h = harness_with(config_for(UNREACHABLE), None);
    let err = h.transport.get("/api/books").await.unwrap_err();
    assert!(err.is_unreachable());
}

#[tokio::test]
async fn dev_fallback_never_masks_real_responses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let h = AuthenticatedTransport::builder(config_for(&server.uri()))
        .credentials(MemoryStore::new())
        .fallback(EmptyOnUnreachable)
        .build()
        .unwrap();

    assert!(matches!(h.get("/api/books").await, Err(ApiError::ServerError(_))));
}
