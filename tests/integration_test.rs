mod helpers;

use std::sync::Arc;

use helpers::{seed, seeded_memory_store, TestDb, TestServer, PASSWORD};
use portcullis::authz::{Operation, Permission, Scope};
use portcullis::storage::{hash_password, BackingStore, Principal, Role};
use reqwest::header::{AUTHORIZATION, CACHE_CONTROL, COOKIE, RETRY_AFTER, SET_COOKIE, WWW_AUTHENTICATE};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

struct LoggedIn {
    token: String,
    cookie: String,
}

async fn login(client: &Client, server: &TestServer, username: &str) -> LoggedIn {
    let response = client
        .post(server.url("/login"))
        .json(&json!({ "username": username, "password": PASSWORD }))
        .send()
        .await
        .expect("login request failed");
    assert_eq!(response.status(), StatusCode::OK);

    let cookie = response
        .headers()
        .get(SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .expect("login should set a session cookie")
        .to_string();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["expires_in"], 3600);

    LoggedIn {
        token: body["access_token"].as_str().unwrap().to_string(),
        cookie,
    }
}

async fn decide(client: &Client, server: &TestServer, token: &str, body: Value) -> reqwest::Response {
    client
        .post(server.url("/v1/decide"))
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_analyst_sees_departmental_report_without_salary() {
    let server = TestServer::start(seeded_memory_store().await, |_| {}).await;
    let client = Client::new();
    let alice = login(&client, &server, "alice").await;

    let response = decide(
        &client,
        &server,
        &alice.token,
        json!({
            "resource_type": "Report",
            "operation": "READ",
            "record": { "owner": "u-bob", "department": "Finance", "title": "Q3", "salary": 91000 }
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-ratelimit-remaining"));

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["decision"], "allow_filtered");
    assert_eq!(body["redacted_fields"], json!(["salary"]));
    assert_eq!(
        body["record"],
        json!({ "owner": "u-bob", "department": "Finance", "title": "Q3" })
    );
}

#[tokio::test]
async fn test_out_of_scope_record_is_forbidden() {
    let server = TestServer::start(seeded_memory_store().await, |_| {}).await;
    let client = Client::new();
    let alice = login(&client, &server, "alice").await;

    let response = decide(
        &client,
        &server,
        &alice.token,
        json!({ "resource_type": "Report", "operation": "READ", "record": { "department": "Sales" } }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], 403);
    assert_eq!(body["code"], "unauthorized");

    let response = decide(
        &client,
        &server,
        &alice.token,
        json!({ "resource_type": "Report", "operation": "WRITE" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_wrong_password_and_missing_credentials() {
    let server = TestServer::start(seeded_memory_store().await, |_| {}).await;
    let client = Client::new();

    let response = client
        .post(server.url("/login"))
        .json(&json!({ "username": "alice", "password": "nope" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client.get(server.url("/v1/me")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers().get(WWW_AUTHENTICATE).unwrap(), "Bearer");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "unauthenticated");
}

#[tokio::test]
async fn test_cookie_session_lifecycle() {
    let server = TestServer::start(seeded_memory_store().await, |_| {}).await;
    let client = Client::new();
    let alice = login(&client, &server, "alice").await;

    let me: Value = client
        .get(server.url("/v1/me"))
        .header(COOKIE, &alice.cookie)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(me["authenticated_via"], "session");
    assert_eq!(me["principal"]["id"], "u-alice");
    assert!(me["principal"].get("password_hash").is_none());
    let first_access = me["session"]["last_accessed_at"].as_i64().unwrap();

    let touched: Value = client
        .put(server.url("/v1/session"))
        .header(COOKIE, &alice.cookie)
        .json(&json!({ "cart": [1, 2] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(touched["payload"], json!({ "cart": [1, 2] }));
    assert!(touched["last_accessed_at"].as_i64().unwrap() > first_access);

    let response = client
        .post(server.url("/logout"))
        .header(COOKIE, &alice.cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = client
        .get(server.url("/v1/me"))
        .header(COOKIE, &alice.cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_bearer_identity_cannot_touch_session() {
    let server = TestServer::start(seeded_memory_store().await, |_| {}).await;
    let client = Client::new();
    let alice = login(&client, &server, "alice").await;

    let response = client
        .put(server.url("/v1/session"))
        .header(AUTHORIZATION, format!("Bearer {}", alice.token))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_key_rotation_over_http() {
    let server = TestServer::start(seeded_memory_store().await, |_| {}).await;
    let client = Client::new();
    let alice = login(&client, &server, "alice").await;

    let keys = server.state.keys.clone();
    let k1 = keys.active_key_id().unwrap();
    let k1_public = keys.published_key(&k1).unwrap();

    let me = |token: String| {
        let client = client.clone();
        let url = server.url("/v1/me");
        async move {
            client
                .get(url)
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .await
                .unwrap()
        }
    };

    keys.rotate().unwrap();
    assert_eq!(me(alice.token.clone()).await.status(), StatusCode::OK);

    keys.unpublish(&k1).unwrap();
    let response = me(alice.token.clone()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "credential_invalid_signature");

    keys.publish(k1_public).unwrap();
    assert_eq!(me(alice.token.clone()).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_jwks_is_cacheable_and_exempt() {
    let server = TestServer::start(seeded_memory_store().await, |s| {
        s.rate_limit.capacity = 1;
        s.rate_limit.refill_per_sec = 0.01;
    })
    .await;
    let client = Client::new();

    for _ in 0..5 {
        let response = client
            .get(server.url("/.well-known/jwks.json"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CACHE_CONTROL).unwrap(),
            "public, max-age=300"
        );
        assert!(!response.headers().contains_key("x-ratelimit-remaining"));
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["keys"].as_array().unwrap().len(), 1);
    }

    let response = client.get(server.url("/healthz")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.state.admission.tracked_keys(), 0);
}

#[tokio::test]
async fn test_rate_limited_requests_get_retry_after() {
    let server = TestServer::start(seeded_memory_store().await, |s| {
        s.rate_limit.capacity = 2;
        s.rate_limit.refill_per_sec = 0.1;
    })
    .await;
    let client = Client::new();

    for remaining in ["1", "0"] {
        let response = client.get(server.url("/v1/me")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), remaining);
    }

    let response = client.get(server.url("/v1/me")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get(RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=10).contains(&retry_after));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], 429);
    assert_eq!(body["code"], "rate_limited");

    // a spoofed forwarding header does not buy a fresh bucket
    let response = client
        .get(server.url("/v1/me"))
        .header("x-forwarded-for", "203.0.113.7")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_forwarded_client_has_own_bucket_behind_trusted_proxy() {
    let server = TestServer::start(seeded_memory_store().await, |s| {
        s.rate_limit.capacity = 1;
        s.rate_limit.refill_per_sec = 0.01;
        s.rate_limit.trust_forwarded_for = true;
    })
    .await;
    let client = Client::new();

    let me = |forwarded: &'static str| {
        client
            .get(server.url("/v1/me"))
            .header("x-forwarded-for", forwarded)
            .send()
    };
    assert_eq!(me("198.51.100.1").await.unwrap().status(), StatusCode::UNAUTHORIZED);
    assert_eq!(me("198.51.100.1").await.unwrap().status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(me("203.0.113.7").await.unwrap().status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_grant_management() {
    let server = TestServer::start(seeded_memory_store().await, |_| {}).await;
    let client = Client::new();
    let root = login(&client, &server, "root").await;
    let alice = login(&client, &server, "alice").await;

    let create = |token: &str, body: Value| {
        client
            .post(server.url("/v1/roles/ANALYST/permissions"))
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .json(&body)
            .send()
    };

    // escalating field entry
    let response = create(
        &root.token,
        json!({
            "id": "report-write-own",
            "resource_type": "Report",
            "operation": "READ",
            "scope": "OWN",
            "field_permissions": { "salary": "WRITE" }
        }),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "validation_error");

    // the analyst lacks CREATE on Permission
    let grant = json!({
        "id": "report-write-own",
        "resource_type": "Report",
        "operation": "WRITE",
        "scope": "OWN",
        "field_permissions": { "salary": "READ" }
    });
    let response = create(&alice.token, grant.clone()).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = create(&root.token, grant).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // visible to the very next decision
    let response = decide(
        &client,
        &server,
        &alice.token,
        json!({ "resource_type": "Report", "operation": "WRITE", "record": { "owner": "u-alice" } }),
    )
    .await;
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["decision"], "allow_filtered");
    assert_eq!(body["redacted_fields"], json!(["salary"]));
    assert_eq!(body["record"], json!({ "owner": "u-alice" }));

    // the write grant only reads salary, so a payload carrying it is refused
    let response = decide(
        &client,
        &server,
        &alice.token,
        json!({
            "resource_type": "Report",
            "operation": "WRITE",
            "record": { "owner": "u-alice", "title": "x", "salary": 1 }
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "unauthorized");

    let listed: Value = client
        .get(server.url("/v1/roles/ANALYST/permissions"))
        .header(AUTHORIZATION, format!("Bearer {}", root.token))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["permissions"].as_array().unwrap().len(), 2);

    let response = client
        .delete(server.url("/v1/roles/ANALYST/permissions/report-write-own"))
        .header(AUTHORIZATION, format!("Bearer {}", root.token))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = decide(
        &client,
        &server,
        &alice.token,
        json!({ "resource_type": "Report", "operation": "WRITE", "record": { "owner": "u-alice" } }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_lower_role_cannot_manage_higher_role() {
    let store = seeded_memory_store().await;
    // ANALYST may create grants, but only for roles at or below its level
    store
        .upsert_permission(
            "ANALYST",
            &Permission::new("analyst-grant-create", "Permission", Operation::Create, Scope::All),
        )
        .await
        .unwrap();
    let server = TestServer::start(store, |_| {}).await;
    let client = Client::new();
    let alice = login(&client, &server, "alice").await;

    let response = client
        .post(server.url("/v1/roles/ADMIN/permissions"))
        .header(AUTHORIZATION, format!("Bearer {}", alice.token))
        .json(&json!({
            "id": "x",
            "resource_type": "Report",
            "operation": "DELETE",
            "scope": "ALL"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_grant_id_of_higher_role_cannot_be_reused() {
    let store = seeded_memory_store().await;
    store.upsert_role(&Role::new("MANAGER", 50)).await.unwrap();
    store
        .upsert_permission(
            "MANAGER",
            &Permission::new("manager-grant-create", "Permission", Operation::Create, Scope::All),
        )
        .await
        .unwrap();
    store
        .upsert_principal(
            &Principal::new("u-mallory", "mallory", "MANAGER")
                .with_password_hash(hash_password(PASSWORD).unwrap()),
        )
        .await
        .unwrap();
    let server = TestServer::start(store.clone(), |_| {}).await;
    let client = Client::new();
    let mallory = login(&client, &server, "mallory").await;

    // ADMIN's grant-delete, re-posted under MANAGER with different terms
    let response = client
        .post(server.url("/v1/roles/MANAGER/permissions"))
        .header(AUTHORIZATION, format!("Bearer {}", mallory.token))
        .json(&json!({
            "id": "grant-delete",
            "resource_type": "Report",
            "operation": "READ",
            "scope": "OWN"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "validation_error");

    let admin = store.find_permissions_by_role("ADMIN").await.unwrap();
    let grant_delete = admin.iter().find(|p| p.id == "grant-delete").unwrap();
    assert_eq!(
        *grant_delete,
        Permission::new("grant-delete", "Permission", Operation::Delete, Scope::All)
    );
    assert!(store
        .find_permissions_by_role("MANAGER")
        .await
        .unwrap()
        .iter()
        .all(|p| p.id != "grant-delete"));
}

#[tokio::test]
async fn test_sqlite_backed_login_and_decide() {
    let db = TestDb::new().await;
    let store = Arc::new(db.store());
    seed(store.as_ref()).await;

    let server = TestServer::start(store, |_| {}).await;
    let client = Client::new();
    let alice = login(&client, &server, "alice").await;

    let response = decide(
        &client,
        &server,
        &alice.token,
        json!({ "resource_type": "Report", "operation": "READ", "record": { "department": "Finance", "salary": 1 } }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["record"], json!({ "department": "Finance" }));

    let me: Value = client
        .get(server.url("/v1/me"))
        .header(COOKIE, &alice.cookie)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(me["principal"]["department"], "Finance");
}
