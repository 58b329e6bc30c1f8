use std::sync::Arc;
use std::time::Duration;

use actix_web::{test, App};
use serial_test::serial;

use sonet::auth::create_token;
use sonet::identity::UnconfiguredIdentityDirectory;
use sonet::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use sonet::repo::inmem::InMemRepo;
use sonet::routes::{config, AppState};
use sonet::security::SecurityHeaders;
use sonet::storage::{PhotoStore, PhotoStoreError};

#[derive(Default)]
struct MockPhotoStore {
    inner: std::sync::Mutex<std::collections::HashMap<String, (Vec<u8>, String)>>,
}

#[async_trait::async_trait]
impl PhotoStore for MockPhotoStore {
    async fn save(&self, key: &str, mime: &str, bytes: &[u8]) -> Result<(), PhotoStoreError> {
        let mut m = self.inner.lock().unwrap();
        if m.contains_key(key) {
            return Err(PhotoStoreError::Duplicate);
        }
        m.insert(key.to_string(), (bytes.to_vec(), mime.to_string()));
        Ok(())
    }
    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), PhotoStoreError> {
        let m = self.inner.lock().unwrap();
        m.get(key).cloned().ok_or(PhotoStoreError::NotFound)
    }
    async fn delete(&self, key: &str) -> Result<(), PhotoStoreError> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }
}

// Helper to ensure JWT secret present & unique temp data dir per test
fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("SONET_DATA_DIR", tmp.path().to_str().unwrap());
}

fn app_state() -> AppState {
    AppState {
        repo: Arc::new(InMemRepo::new()),
        photo_store: Arc::new(MockPhotoStore::default()),
        identity: Arc::new(UnconfiguredIdentityDirectory),
        // rate limiting is exercised by its own test below
        limiter: RateLimiterFacade::new(
            InMemoryRateLimiter::new(false),
            RateLimitConfig::from_env(),
        ),
    }
}

fn token(uid: &str) -> String {
    create_token(uid, &format!("{uid}@example.com"), true).unwrap()
}

macro_rules! bearer {
    ($t:expr) => {
        ("Authorization", format!("Bearer {}", $t))
    };
}

#[actix_web::test]
#[serial]
async fn post_comment_reply_flow() {
    setup_env();
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;

    // unauthenticated writes are rejected
    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .set_json(serde_json::json!({"title":"x","text":"y","photo":null}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    // create post
    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .insert_header(bearer!(token("u1")))
        .set_json(serde_json::json!({"title":"Hello","text":"first","photo":null}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let post: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let post_id = post["id"].as_str().unwrap().to_string();
    assert_eq!(post["likes_count"], 0);

    // comment on it
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/posts/{post_id}/comments"))
        .insert_header(bearer!(token("u2")))
        .set_json(serde_json::json!({"content":"nice","parent_id":null}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let comment: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let comment_id = comment["id"].as_str().unwrap().to_string();

    // reply to the comment
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/posts/{post_id}/comments"))
        .insert_header(bearer!(token("u3")))
        .set_json(serde_json::json!({"content":"agreed","parent_id":comment_id}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let reply: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let reply_id = reply["id"].as_str().unwrap().to_string();

    // reply-to-reply is rejected with 400
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/posts/{post_id}/comments"))
        .insert_header(bearer!(token("u4")))
        .set_json(serde_json::json!({"content":"nope","parent_id":reply_id}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    // over-long content is rejected
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/posts/{post_id}/comments"))
        .insert_header(bearer!(token("u4")))
        .set_json(serde_json::json!({"content":"x".repeat(301),"parent_id":null}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    // comment on a missing post
    let req = test::TestRequest::post()
        .uri("/api/v1/posts/missing/comments")
        .insert_header(bearer!(token("u4")))
        .set_json(serde_json::json!({"content":"hi","parent_id":null}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    // listings: one top-level comment, one reply under it
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/posts/{post_id}/comments"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let page: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert_eq!(page["has_more"], false);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/comments/{comment_id}/replies"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let page: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
}

#[actix_web::test]
#[serial]
async fn reaction_toggle_over_http() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .insert_header(bearer!(token("u1")))
        .set_json(serde_json::json!({"title":"T","text":"t","photo":null}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let post: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let post_id = post["id"].as_str().unwrap().to_string();

    // PUT is idempotent-on-state: like, then toggle off
    let req = test::TestRequest::put()
        .uri(&format!("/api/v1/posts/{post_id}/reaction"))
        .insert_header(bearer!(token("u2")))
        .set_json(serde_json::json!({"type":"like"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let out: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(out["applied"], "like");

    // stats read the viewer's own record directly
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/posts/{post_id}/reactions"))
        .insert_header(bearer!(token("u2")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let stats: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(stats["viewer_reaction"], "like");

    let req = test::TestRequest::put()
        .uri(&format!("/api/v1/posts/{post_id}/reaction"))
        .insert_header(bearer!(token("u2")))
        .set_json(serde_json::json!({"type":"like"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let out: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(out["applied"], serde_json::Value::Null);

    // reacting to a missing post is 404
    let req = test::TestRequest::put()
        .uri("/api/v1/posts/missing/reaction")
        .insert_header(bearer!(token("u2")))
        .set_json(serde_json::json!({"type":"dislike"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
#[serial]
async fn ownership_is_enforced() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .insert_header(bearer!(token("owner")))
        .set_json(serde_json::json!({"title":"T","text":"t","photo":null}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let post: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let post_id = post["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/posts/{post_id}/comments"))
        .insert_header(bearer!(token("owner")))
        .set_json(serde_json::json!({"content":"mine","parent_id":null}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let comment: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let comment_id = comment["id"].as_str().unwrap().to_string();

    // another user cannot edit or delete
    let req = test::TestRequest::patch()
        .uri(&format!("/api/v1/comments/{comment_id}"))
        .insert_header(bearer!(token("intruder")))
        .set_json(serde_json::json!({"content":"hacked"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/posts/{post_id}"))
        .insert_header(bearer!(token("intruder")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    // a user may only delete their own account
    let req = test::TestRequest::delete()
        .uri("/api/v1/users/owner")
        .insert_header(bearer!(token("intruder")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
}

#[actix_web::test]
#[serial]
async fn pagination_walk_over_http() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;

    for i in 0..25 {
        let req = test::TestRequest::post()
            .uri("/api/v1/posts")
            .insert_header(bearer!(token("u1")))
            .set_json(serde_json::json!({"title":format!("post {i}"),"text":"t","photo":null}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 201);
    }

    let mut seen = std::collections::HashSet::new();
    let mut cursor: Option<String> = None;
    let mut shapes = Vec::new();
    loop {
        let uri = match &cursor {
            Some(c) => format!("/api/v1/posts?limit=10&cursor={c}"),
            None => "/api/v1/posts?limit=10".to_string(),
        };
        let req = test::TestRequest::get().uri(&uri).to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let page: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
        let items = page["items"].as_array().unwrap();
        shapes.push((items.len(), page["has_more"].as_bool().unwrap()));
        for item in items {
            assert!(seen.insert(item["id"].as_str().unwrap().to_string()));
        }
        match page["next_cursor"].as_str() {
            Some(c) => cursor = Some(c.to_string()),
            None => break,
        }
    }
    assert_eq!(shapes, vec![(10, true), (10, true), (5, false)]);
    assert_eq!(seen.len(), 25);
}

#[actix_web::test]
#[serial]
async fn profile_sync_feeds_author_denormalization() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::put()
        .uri("/api/v1/users/me")
        .insert_header(bearer!(token("ada")))
        .set_json(serde_json::json!({"name":"Ada","surname":"Lovelace","photo":null}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .insert_header(bearer!(token("ada")))
        .set_json(serde_json::json!({"title":"T","text":"t","photo":null}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let post: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(post["user"]["name"], "Ada");
    let post_id = post["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/posts/{post_id}/comments"))
        .insert_header(bearer!(token("ada")))
        .set_json(serde_json::json!({"content":"hi","parent_id":null}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let comment: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(comment["author_username"], "Ada Lovelace");
}

#[actix_web::test]
#[serial]
async fn write_budgets_return_429() {
    setup_env();
    let mut state = app_state();
    state.limiter = RateLimiterFacade::new(
        InMemoryRateLimiter::new(true),
        RateLimitConfig {
            post_limit: 1,
            post_window: Duration::from_secs(60),
            comment_limit: 100,
            comment_window: Duration::from_secs(60),
            reaction_limit: 100,
            reaction_window: Duration::from_secs(60),
        },
    );
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .insert_header(bearer!(token("spammer")))
        .set_json(serde_json::json!({"title":"a","text":"b","photo":null}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);

    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .insert_header(bearer!(token("spammer")))
        .set_json(serde_json::json!({"title":"a","text":"b","photo":null}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 429);
}

// Minimal test for get_photo after upload (PNG bytes)
#[actix_web::test]
#[serial]
async fn photo_upload_and_fetch() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;

    let boundary = "BOUNDARYHASH";
    let png: Vec<u8> = vec![
        0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A,
        0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D', b'R',
        0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4, 0x89,
        0x00, 0x00, 0x00, 0x0A, b'I', b'D', b'A', b'T', 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4,
        0x00, 0x00, 0x00, 0x00, b'I', b'E', b'N', b'D', 0xAE, 0x42, 0x60, 0x82,
    ];
    let mut body: Vec<u8> = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.png\"\r\nContent-Type: application/octet-stream\r\n\r\n").as_bytes());
    body.extend_from_slice(&png);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let req = test::TestRequest::post()
        .uri("/api/v1/photos")
        .insert_header(bearer!(token("u1")))
        .insert_header(("Content-Type", format!("multipart/form-data; boundary={boundary}")))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let uploaded: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let key = uploaded["key"].as_str().unwrap();

    let req = test::TestRequest::get().uri(&format!("/photos/{key}")).to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let ct = resp.headers().get("content-type").unwrap().to_str().unwrap();
    assert_eq!(ct, "image/png");
}
