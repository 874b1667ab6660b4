//! HTTP surface tests: drive the axum router in-process with `oneshot`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use coursegate::audit::{integrity_hash, AuditLogEntry, AuditStore, MemoryAuditStore, SecurityEvent, StoreError};
use coursegate::clock::ManualClock;
use coursegate::config::GateConfig;
use coursegate::identity::{hash_password, DirectoryUser, MemoryCourseCatalog, MemoryUserDirectory, Role};
use coursegate::server::{router, AppState, INTEGRITY_HEADER};

struct TestApp {
    app: Router,
    clock: Arc<ManualClock>,
    store: Arc<SwitchableStore>,
}

/// In-memory store whose writes can be switched off mid-test.
#[derive(Default)]
struct SwitchableStore {
    inner: MemoryAuditStore,
    down: AtomicBool,
}

impl SwitchableStore {
    fn set_down(&self, down: bool) { self.down.store(down, Ordering::SeqCst); }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) { Err(StoreError("switched off".into())) } else { Ok(()) }
    }
}

impl AuditStore for SwitchableStore {
    fn append(&self, entry: AuditLogEntry) -> Result<(), StoreError> {
        self.check()?;
        self.inner.append(entry)
    }

    fn append_security_event(&self, event: SecurityEvent) -> Result<(), StoreError> {
        self.check()?;
        self.inner.append_security_event(event)
    }

    fn entries(&self) -> Result<Vec<AuditLogEntry>, StoreError> { self.inner.entries() }

    fn security_events_since(&self, since: DateTime<Utc>) -> Result<Vec<SecurityEvent>, StoreError> {
        self.inner.security_events_since(since)
    }
}

fn user(id: &str, email: &str, role: Role, password: &str, name: &str) -> DirectoryUser {
    DirectoryUser {
        principal_id: id.into(),
        email: email.into(),
        role,
        password_hash: hash_password(password).unwrap(),
        display_name: name.into(),
        privilege_level: None,
    }
}

fn test_app() -> TestApp {
    let clock = Arc::new(ManualClock::default());
    let directory = Arc::new(MemoryUserDirectory::new());
    directory.insert(user("adm-1", "admin@example.com", Role::Admin, "admin-pw", "Ada Admin"));
    directory.insert(user("stu-1", "student@example.com", Role::Student, "student-pw", "Sam Student"));
    let catalog = Arc::new(MemoryCourseCatalog::new());
    catalog.put_course("paid", true, 4_900, Some("ins-1"));
    catalog.put_course("free", true, 0, Some("ins-1"));
    catalog.enroll("stu-1", "paid");
    catalog.enroll("stu-1", "free");

    let store = Arc::new(SwitchableStore::default());
    let state = AppState::build(&GateConfig::with_secret("http-secret"), clock.clone(), directory, catalog, store.clone());
    TestApp { app: router(state), clock, store }
}

fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut b = Request::builder().method(method).uri(uri).header("x-forwarded-for", "198.51.100.4");
    if let Some(t) = token {
        b = b.header(header::AUTHORIZATION, format!("Bearer {}", t));
    }
    match body {
        Some(v) => b.header(header::CONTENT_TYPE, "application/json").body(Body::from(v.to_string())).unwrap(),
        None => b.body(Body::empty()).unwrap(),
    }
}

impl TestApp {
    async fn send(&self, req: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, headers, bytes.to_vec())
    }

    async fn json(&self, req: Request<Body>) -> (StatusCode, Value) {
        let (status, _, body) = self.send(req).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn login(&self, path: &str, email: &str, password: &str) -> (StatusCode, Value) {
        self.json(request(Method::POST, path, None, Some(json!({"email": email, "password": password})))).await
    }

    async fn admin_token(&self) -> (String, String) {
        let (status, body) = self.login("/auth/admin/login", "admin@example.com", "admin-pw").await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        let token = body["token"].as_str().unwrap().to_string();
        let sid = body["principal"]["session_id"].as_str().unwrap().to_string();
        (token, sid)
    }
}

#[tokio::test]
async fn admin_session_lifecycle() {
    let t = test_app();
    let (token, sid) = t.admin_token().await;

    let (status, body) = t.json(request(Method::GET, "/auth/admin/session", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"], sid);
    assert_eq!(body["warning"], false);

    t.clock.advance(Duration::from_secs(4 * 3600 - 600));
    let (status, body) = t.json(request(Method::GET, "/auth/admin/session", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    // activity keeps the session alive but the token still ends on schedule
    assert_eq!(body["warning"], true);
    assert_eq!(body["remaining_secs"], 600);

    let (status, body) = t.json(request(Method::POST, "/auth/admin/logout", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_ended"], true);

    let (status, body) = t.json(request(Method::GET, "/auth/admin/session", Some(&token), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "session_invalid");
}

#[tokio::test]
async fn students_cannot_reach_admin_routes() {
    let t = test_app();
    let (status, body) = t.login("/auth/admin/login", "student@example.com", "student-pw").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason"], "role");

    let (status, body) = t.login("/auth/login", "student@example.com", "student-pw").await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();

    let (status, body) = t.json(request(Method::GET, "/admin/sessions", Some(&token), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "token_invalid");

    let (status, body) = t.json(request(Method::GET, "/admin/sessions", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthenticated");
}

#[tokio::test]
async fn expired_and_invalid_tokens_share_a_message() {
    let t = test_app();
    let (token, _) = t.admin_token().await;
    t.clock.advance(Duration::from_secs(4 * 3600 + 1));

    let (status, expired) = t.json(request(Method::GET, "/admin/audit", Some(&token), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(expired["code"], "token_expired");

    let (_, invalid) = t.json(request(Method::GET, "/admin/audit", Some("garbage.token.value"), None)).await;
    assert_eq!(invalid["code"], "token_invalid");
    assert_eq!(expired["message"], invalid["message"]);
}

#[tokio::test]
async fn force_logout_ends_another_session_and_is_audited() {
    let t = test_app();
    let (mine, _) = t.admin_token().await;
    let (theirs, their_sid) = t.admin_token().await;

    let (status, body) = t.json(request(Method::GET, "/admin/sessions", Some(&mine), None)).await;
    assert_eq!(status, StatusCode::OK);
    let sessions = body.as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s["profile"]["display_name"] == "Ada Admin"));

    let uri = format!("/admin/sessions/{}", their_sid);
    let (status, body) = t.json(request(Method::DELETE, &uri, Some(&mine), Some(json!({"reason": "lost laptop"})))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["terminated_by"], "adm-1");
    assert_eq!(body["reason"], "lost laptop");

    let (status, body) = t.json(request(Method::GET, "/auth/admin/session", Some(&theirs), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "session_invalid");

    let (status, _) = t.json(request(Method::DELETE, &uri, Some(&mine), Some(json!({})))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, page) = t.json(request(Method::GET, "/admin/audit?action=force_logout&order=asc", Some(&mine), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 2);
    let first = page["entries"][0]["change_description"].as_str().unwrap();
    assert!(first.contains("lost laptop"));
    assert_eq!(page["entries"][0]["resource_id"], their_sid.as_str());
}

#[tokio::test]
async fn force_logout_without_body_records_unspecified_reason() {
    let t = test_app();
    let (mine, _) = t.admin_token().await;
    let (theirs, their_sid) = t.admin_token().await;

    let uri = format!("/admin/sessions/{}", their_sid);
    let (status, body) = t.json(request(Method::DELETE, &uri, Some(&mine), None)).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["reason"], "unspecified");

    let (status, _) = t.json(request(Method::GET, "/auth/admin/session", Some(&theirs), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, page) = t.json(request(Method::GET, "/admin/audit?action=force_logout", Some(&mine), None)).await;
    assert_eq!(page["total"], 1);
    assert!(page["entries"][0]["change_description"].as_str().unwrap().contains("unspecified"));
}

#[tokio::test]
async fn force_logout_fails_closed_when_trail_is_down() {
    let t = test_app();
    let (mine, _) = t.admin_token().await;
    let (theirs, their_sid) = t.admin_token().await;

    t.store.set_down(true);
    let uri = format!("/admin/sessions/{}", their_sid);
    let (status, body) = t.json(request(Method::DELETE, &uri, Some(&mine), Some(json!({"reason": "audit me"})))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "storage_unavailable");
    t.store.set_down(false);

    // nothing was written, so nothing was terminated
    let (status, body) = t.json(request(Method::GET, "/auth/admin/session", Some(&theirs), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"], their_sid.as_str());
    let (_, page) = t.json(request(Method::GET, "/admin/audit?action=force_logout", Some(&mine), None)).await;
    assert_eq!(page["total"], 0);
}

#[tokio::test]
async fn unparseable_query_is_a_gate_error() {
    let t = test_app();
    let (token, _) = t.admin_token().await;
    for uri in [
        "/admin/audit?order=sideways",
        "/admin/audit/export?page=first",
        "/admin/security/login-attempts?days=week",
        "/admin/security/events?min_severity=loud",
    ] {
        let (status, body) = t.json(request(Method::GET, uri, Some(&token), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(body["code"], "bad_request", "{}", uri);
    }
}

#[tokio::test]
async fn audit_export_carries_integrity_hash() {
    let t = test_app();
    let (token, _) = t.admin_token().await;

    let (status, headers, body) = t.send(request(Method::GET, "/admin/audit/export?format=csv", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/csv"));
    assert_eq!(headers[INTEGRITY_HEADER].to_str().unwrap(), integrity_hash(&body));
    let text = String::from_utf8(body).unwrap();
    assert!(text.starts_with("id,"));
    assert!(text.contains("admin_login"));

    let (status, body) = t.json(request(Method::GET, "/admin/audit/export?format=xml", Some(&token), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");

    // the csv export wrote its own entry
    let (_, page) = t.json(request(Method::GET, "/admin/audit?action=export_audit_log", Some(&token), None)).await;
    assert_eq!(page["total"], 1);
}

#[tokio::test]
async fn repeated_failures_flag_the_origin() {
    let t = test_app();
    for _ in 0..4 {
        let (status, _) = t.login("/auth/login", "student@example.com", "wrong").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    let (token, _) = t.admin_token().await;

    let (status, body) = t.json(request(Method::GET, "/admin/security/login-attempts?days=1", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["failure_count"], 4);
    assert_eq!(body["success_count"], 1);
    assert_eq!(body["suspicious_origins"], json!(["198.51.100.4"]));

    let (status, _) = t.json(request(Method::GET, "/admin/security/login-attempts?days=0", Some(&token), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, events) = t.json(request(Method::GET, "/admin/security/events?min_severity=medium", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    let events = events.as_array().unwrap();
    // four failures plus the admin login, newest first
    assert_eq!(events.len(), 5);
    assert_eq!(events[0]["event_type"], "admin_login");
    assert!(events[1..].iter().all(|e| e["event_type"] == "failed_login"));
}

#[tokio::test]
async fn course_access_follows_policy() {
    let t = test_app();
    let (_, body) = t.login("/auth/login", "student@example.com", "student-pw").await;
    let token = body["token"].as_str().unwrap().to_string();

    let (status, body) = t.json(request(Method::GET, "/courses/free/access", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["access"], "granted");

    let (status, body) = t.json(request(Method::GET, "/courses/paid/access", Some(&token), None)).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "payment_required");

    let (status, _) = t.json(request(Method::GET, "/courses/missing/access", Some(&token), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = t.json(request(Method::GET, "/lessons/missing/access", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
