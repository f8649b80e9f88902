//! End-to-end integration tests for the case gateway.
//!
//! These tests start a real Axum server on a random port over the embedded
//! backend, plus a mock AI assignment service, and verify the full flows:
//! - sign-up / sign-in / friendly auth errors
//! - case intake with AI assignment (success and failure)
//! - role-scoped listings and internal-note gating
//! - feedback rules (client-only, closed-case-only, upsert)
//! - attachment upload, sanitization, download, delete
//! - the per-case SSE live feed (snapshot replay + insert + notification)

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::Argon2;
use axum::{extract::State, routing::post, Json, Router};
use tokio::time::timeout;
use uuid::Uuid;

use caseline::assign::AssignClient;
use caseline::auth::AuthService;
use caseline::config::AuthConfig;
use caseline::db::memory::MemoryBackend;
use caseline::db::{CreateUserParams, Database, UserRole, UserStore};
use caseline::gateway::server::{start_server, AppState};
use caseline::gateway::sse::FeedHub;
use caseline::storage::LocalStorage;

const TIMEOUT: Duration = Duration::from_secs(5);
const AGENT_EMAIL: &str = "agent@firm.example";
const AGENT_PASSWORD: &str = "agent-password-1";

// --- Mock AI service ---

#[derive(Clone)]
enum MockAiBehavior {
    Assign { email: String },
    Fail { detail: String },
}

#[derive(Clone)]
struct MockAiState {
    behavior: MockAiBehavior,
    requests: Arc<Mutex<Vec<serde_json::Value>>>,
}

async fn mock_assign_handler(
    State(state): State<MockAiState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    state.requests.lock().unwrap().push(body);
    match &state.behavior {
        MockAiBehavior::Assign { email } => Ok(Json(serde_json::json!({
            "assigned_agent_id": email,
            "confidence_score": 0.91,
            "reasoning": "agent handles vehicle injury intake",
            "tags": ["personal-injury", "vehicle"]
        }))),
        MockAiBehavior::Fail { detail } => Err((
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "detail": detail })),
        )),
    }
}

async fn start_mock_ai(
    behavior: MockAiBehavior,
) -> (String, Arc<Mutex<Vec<serde_json::Value>>>) {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = MockAiState {
        behavior,
        requests: requests.clone(),
    };
    let app = Router::new()
        .route("/assign", post(mock_assign_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), requests)
}

// --- Test server harness ---

struct TestServer {
    base_url: String,
    http: reqwest::Client,
    state: Arc<AppState>,
    _storage_dir: tempfile::TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn start_test_server(ai_base_url: &str) -> TestServer {
    let storage_dir = tempfile::tempdir().unwrap();
    let db: Arc<dyn Database> = Arc::new(MemoryBackend::new());

    seed_agent(&db).await;

    let state = Arc::new(AppState {
        db: db.clone(),
        auth: AuthService::new(
            db,
            &AuthConfig {
                require_email_confirmation: false,
                session_ttl_hours: 1,
            },
        ),
        storage: Arc::new(LocalStorage::new(storage_dir.path())),
        assign: AssignClient::new(ai_base_url),
        feed: FeedHub::new(),
        shutdown_tx: tokio::sync::RwLock::new(None),
    });

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let bound = start_server(addr, state.clone(), &[])
        .await
        .expect("Failed to start test server");

    TestServer {
        base_url: format!("http://{bound}"),
        http: reqwest::Client::new(),
        state,
        _storage_dir: storage_dir,
    }
}

/// Sign-up only creates clients; the agent account is seeded directly.
async fn seed_agent(db: &Arc<dyn Database>) {
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(AGENT_PASSWORD.as_bytes(), &salt)
        .unwrap()
        .to_string();
    db.create_user(&CreateUserParams {
        email: AGENT_EMAIL.to_string(),
        full_name: "Avery Agent".to_string(),
        role: UserRole::Agent,
        password_hash,
        confirmation_token_hash: None,
        email_confirmed: true,
    })
    .await
    .unwrap();
}

async fn sign_up_client(server: &TestServer, email: &str) -> String {
    let response = server
        .http
        .post(server.url("/api/auth/signup"))
        .json(&serde_json::json!({
            "email": email,
            "password": "client-password-1",
            "full_name": "Casey Client"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    body["session"]["token"].as_str().unwrap().to_string()
}

async fn sign_in(server: &TestServer, email: &str, password: &str) -> String {
    let response = server
        .http
        .post(server.url("/api/auth/login"))
        .json(&serde_json::json!({ "email": email, "password": password }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    body["token"].as_str().unwrap().to_string()
}

async fn create_case(server: &TestServer, token: &str) -> serde_json::Value {
    let response = server
        .http
        .post(server.url("/api/cases"))
        .bearer_auth(token)
        .json(&serde_json::json!({
            "title": "Car Accident",
            "description": "rear-ended at intersection"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    response.json().await.unwrap()
}

// --- Tests ---

#[tokio::test]
async fn health_is_public() {
    let (ai_url, _) = start_mock_ai(MockAiBehavior::Fail {
        detail: "unused".to_string(),
    })
    .await;
    let server = start_test_server(&ai_url).await;

    let body: serde_json::Value = server
        .http
        .get(server.url("/api/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn protected_routes_require_a_bearer_token() {
    let (ai_url, _) = start_mock_ai(MockAiBehavior::Fail {
        detail: "unused".to_string(),
    })
    .await;
    let server = start_test_server(&ai_url).await;

    let response = server
        .http
        .get(server.url("/api/cases"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn auth_errors_map_to_friendly_messages() {
    let (ai_url, _) = start_mock_ai(MockAiBehavior::Fail {
        detail: "unused".to_string(),
    })
    .await;
    let server = start_test_server(&ai_url).await;

    sign_up_client(&server, "client@example.com").await;

    // Duplicate sign-up.
    let response = server
        .http
        .post(server.url("/api/auth/signup"))
        .json(&serde_json::json!({
            "email": "client@example.com",
            "password": "client-password-1",
            "full_name": "Casey Client"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    assert!(response.text().await.unwrap().contains("already registered"));

    // Wrong password.
    let response = server
        .http
        .post(server.url("/api/auth/login"))
        .json(&serde_json::json!({
            "email": "client@example.com",
            "password": "not-the-password"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert!(
        response
            .text()
            .await
            .unwrap()
            .contains("Invalid email or password")
    );
}

#[tokio::test]
async fn case_intake_runs_ai_assignment_end_to_end() {
    let (ai_url, requests) = start_mock_ai(MockAiBehavior::Assign {
        email: AGENT_EMAIL.to_string(),
    })
    .await;
    let server = start_test_server(&ai_url).await;

    let client_token = sign_up_client(&server, "client@example.com").await;
    let created = create_case(&server, &client_token).await;

    // The AI service saw the case text.
    {
        let seen = requests.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["title"], "Car Accident");
        assert_eq!(seen[0]["description"], "rear-ended at intersection");
    }

    // Assignment landed on the case.
    let case = &created["case"];
    assert!(created.get("assignment_error").is_none());
    assert!(case["assigned_agent_id"].is_string());
    let custom = &case["custom_fields"];
    assert_eq!(
        custom["ai_assignment_explanation"],
        "agent handles vehicle injury intake"
    );
    assert_eq!(custom["ai_confidence_score"], 0.91);
    assert_eq!(custom["case_tags"][0], "personal-injury");

    // Dashboard listing shows the new case with its status.
    let list: serde_json::Value = server
        .http
        .get(server.url("/api/cases"))
        .bearer_auth(&client_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["cases"].as_array().unwrap().len(), 1);
    assert_eq!(list["cases"][0]["status_name"], "Intake");
    assert_eq!(list["cases"][0]["title"], "Car Accident");
}

#[tokio::test]
async fn failed_assignment_leaves_the_case_unassigned() {
    let (ai_url, _) = start_mock_ai(MockAiBehavior::Fail {
        detail: "no agents available".to_string(),
    })
    .await;
    let server = start_test_server(&ai_url).await;

    let client_token = sign_up_client(&server, "client@example.com").await;
    let created = create_case(&server, &client_token).await;

    assert!(created["case"]["assigned_agent_id"].is_null());
    assert!(
        created["assignment_error"]
            .as_str()
            .unwrap()
            .contains("no agents available")
    );
}

#[tokio::test]
async fn internal_notes_are_gated_to_staff() {
    let (ai_url, _) = start_mock_ai(MockAiBehavior::Assign {
        email: AGENT_EMAIL.to_string(),
    })
    .await;
    let server = start_test_server(&ai_url).await;

    let client_token = sign_up_client(&server, "client@example.com").await;
    let created = create_case(&server, &client_token).await;
    let case_id = created["case"]["id"].as_str().unwrap().to_string();

    // The client cannot read or write internal notes.
    let response = server
        .http
        .get(server.url(&format!("/api/cases/{case_id}/notes")))
        .bearer_auth(&client_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // The assigned agent can.
    let agent_token = sign_in(&server, AGENT_EMAIL, AGENT_PASSWORD).await;
    let response = server
        .http
        .post(server.url(&format!("/api/cases/{case_id}/notes")))
        .bearer_auth(&agent_token)
        .json(&serde_json::json!({ "content": "client called, gathering records" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let notes: serde_json::Value = server
        .http
        .get(server.url(&format!("/api/cases/{case_id}/notes")))
        .bearer_auth(&agent_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(notes["notes"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn other_clients_cannot_see_the_case() {
    let (ai_url, _) = start_mock_ai(MockAiBehavior::Assign {
        email: AGENT_EMAIL.to_string(),
    })
    .await;
    let server = start_test_server(&ai_url).await;

    let owner_token = sign_up_client(&server, "owner@example.com").await;
    let created = create_case(&server, &owner_token).await;
    let case_id = created["case"]["id"].as_str().unwrap().to_string();

    let other_token = sign_up_client(&server, "other@example.com").await;
    let response = server
        .http
        .get(server.url(&format!("/api/cases/{case_id}")))
        .bearer_auth(&other_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // And their dashboard stays empty.
    let list: serde_json::Value = server
        .http
        .get(server.url("/api/cases"))
        .bearer_auth(&other_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(list["cases"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn feedback_requires_a_closed_case_and_upserts() {
    let (ai_url, _) = start_mock_ai(MockAiBehavior::Assign {
        email: AGENT_EMAIL.to_string(),
    })
    .await;
    let server = start_test_server(&ai_url).await;

    let client_token = sign_up_client(&server, "client@example.com").await;
    let created = create_case(&server, &client_token).await;
    let case_id = created["case"]["id"].as_str().unwrap().to_string();

    // Case is still in Intake: feedback is rejected.
    let response = server
        .http
        .put(server.url(&format!("/api/cases/{case_id}/feedback")))
        .bearer_auth(&client_token)
        .json(&serde_json::json!({ "rating": 5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    // The assigned agent closes the case.
    let agent_token = sign_in(&server, AGENT_EMAIL, AGENT_PASSWORD).await;
    let statuses: serde_json::Value = server
        .http
        .get(server.url("/api/statuses"))
        .bearer_auth(&agent_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let closed_id = statuses["statuses"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["status_name"] == "Closed")
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();
    let response = server
        .http
        .put(server.url(&format!("/api/cases/{case_id}/status")))
        .bearer_auth(&agent_token)
        .json(&serde_json::json!({ "status_id": closed_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Rating bounds are enforced.
    let response = server
        .http
        .put(server.url(&format!("/api/cases/{case_id}/feedback")))
        .bearer_auth(&client_token)
        .json(&serde_json::json!({ "rating": 6 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Submit, then revise; one row per case.
    let response = server
        .http
        .put(server.url(&format!("/api/cases/{case_id}/feedback")))
        .bearer_auth(&client_token)
        .json(&serde_json::json!({ "rating": 3, "comments": "slow at first" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let first: serde_json::Value = response.json().await.unwrap();

    let response = server
        .http
        .put(server.url(&format!("/api/cases/{case_id}/feedback")))
        .bearer_auth(&client_token)
        .json(&serde_json::json!({ "rating": 5, "comments": "great outcome" }))
        .send()
        .await
        .unwrap();
    let second: serde_json::Value = response.json().await.unwrap();
    assert_eq!(first["feedback"]["id"], second["feedback"]["id"]);
    assert_eq!(second["feedback"]["rating"], 5);

    // The agent cannot leave feedback.
    let response = server
        .http
        .put(server.url(&format!("/api/cases/{case_id}/feedback")))
        .bearer_auth(&agent_token)
        .json(&serde_json::json!({ "rating": 5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn attachment_upload_sanitizes_and_round_trips() {
    let (ai_url, _) = start_mock_ai(MockAiBehavior::Assign {
        email: AGENT_EMAIL.to_string(),
    })
    .await;
    let server = start_test_server(&ai_url).await;

    let client_token = sign_up_client(&server, "client@example.com").await;
    let created = create_case(&server, &client_token).await;
    let case_id = created["case"]["id"].as_str().unwrap().to_string();

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(b"photo bytes".to_vec())
            .file_name("../../etc/crash photo.jpg")
            .mime_str("image/jpeg")
            .unwrap(),
    );
    let response = server
        .http
        .post(server.url(&format!("/api/cases/{case_id}/attachments")))
        .bearer_auth(&client_token)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    let attachment = &body["attachment"];
    assert_eq!(attachment["file_name"], "crash photo.jpg");
    assert_eq!(attachment["file_type"], "image/jpeg");
    assert_eq!(attachment["file_size"], 11);
    let attachment_id = attachment["id"].as_str().unwrap().to_string();

    // Download returns the original bytes and content type.
    let response = server
        .http
        .get(server.url(&format!("/api/attachments/{attachment_id}/download")))
        .bearer_auth(&client_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()[reqwest::header::CONTENT_TYPE],
        "image/jpeg"
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"photo bytes");

    // Listing includes the uploader join.
    let list: serde_json::Value = server
        .http
        .get(server.url(&format!("/api/cases/{case_id}/attachments")))
        .bearer_auth(&client_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["attachments"][0]["uploader"]["email"], "client@example.com");

    // Delete removes row and object.
    let response = server
        .http
        .delete(server.url(&format!("/api/attachments/{attachment_id}")))
        .bearer_auth(&client_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let response = server
        .http
        .get(server.url(&format!("/api/attachments/{attachment_id}/download")))
        .bearer_auth(&client_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn oversized_uploads_are_rejected() {
    let (ai_url, _) = start_mock_ai(MockAiBehavior::Assign {
        email: AGENT_EMAIL.to_string(),
    })
    .await;
    let server = start_test_server(&ai_url).await;

    let client_token = sign_up_client(&server, "client@example.com").await;
    let created = create_case(&server, &client_token).await;
    let case_id = created["case"]["id"].as_str().unwrap().to_string();

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(vec![0u8; 10 * 1024 * 1024 + 1])
            .file_name("dashcam.mp4")
            .mime_str("video/mp4")
            .unwrap(),
    );
    let response = server
        .http
        .post(server.url(&format!("/api/cases/{case_id}/attachments")))
        .bearer_auth(&client_token)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);

    // Nothing was stored.
    let list: serde_json::Value = server
        .http
        .get(server.url(&format!("/api/cases/{case_id}/attachments")))
        .bearer_auth(&client_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(list["attachments"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn message_attachment_links_are_validated() {
    let (ai_url, _) = start_mock_ai(MockAiBehavior::Assign {
        email: AGENT_EMAIL.to_string(),
    })
    .await;
    let server = start_test_server(&ai_url).await;

    let client_token = sign_up_client(&server, "client@example.com").await;
    let created = create_case(&server, &client_token).await;
    let case_id = created["case"]["id"].as_str().unwrap().to_string();

    // Unknown message id is rejected before anything is stored.
    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(b"x".to_vec()).file_name("note.txt"),
        )
        .text("message_id", Uuid::new_v4().to_string());
    let response = server
        .http
        .post(server.url(&format!("/api/cases/{case_id}/attachments")))
        .bearer_auth(&client_token)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);

    // A real message on the same case links fine.
    let message: serde_json::Value = server
        .http
        .post(server.url(&format!("/api/cases/{case_id}/messages")))
        .bearer_auth(&client_token)
        .json(&serde_json::json!({ "content": "attaching the police report" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let message_id = message["message"]["id"].as_str().unwrap().to_string();

    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(b"report".to_vec()).file_name("report.pdf"),
        )
        .text("message_id", message_id);
    let response = server
        .http
        .post(server.url(&format!("/api/cases/{case_id}/attachments")))
        .bearer_auth(&client_token)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
}

/// Collect SSE frames until `wanted` event names have been seen or the
/// timeout elapses. Returns (event_name, data_json) pairs.
async fn read_sse_events(
    response: reqwest::Response,
    wanted: usize,
) -> Vec<(String, serde_json::Value)> {
    let mut response = response;
    let mut buffer = String::new();
    let mut events = Vec::new();

    let _ = timeout(TIMEOUT, async {
        while let Ok(Some(chunk)) = response.chunk().await {
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(boundary) = buffer.find("\n\n") {
                let frame = buffer[..boundary].to_string();
                buffer.drain(..boundary + 2);
                let mut name = String::new();
                let mut data = String::new();
                for line in frame.lines() {
                    if let Some(rest) = line.strip_prefix("event:") {
                        name = rest.trim().to_string();
                    } else if let Some(rest) = line.strip_prefix("data:") {
                        data.push_str(rest.trim());
                    }
                }
                if !name.is_empty() {
                    let parsed =
                        serde_json::from_str(&data).unwrap_or(serde_json::Value::Null);
                    events.push((name, parsed));
                }
            }
            if events.len() >= wanted {
                break;
            }
        }
    })
    .await;

    events
}

#[tokio::test]
async fn live_feed_replays_snapshot_then_streams_inserts() {
    let (ai_url, _) = start_mock_ai(MockAiBehavior::Assign {
        email: AGENT_EMAIL.to_string(),
    })
    .await;
    let server = start_test_server(&ai_url).await;

    let client_token = sign_up_client(&server, "client@example.com").await;
    let created = create_case(&server, &client_token).await;
    let case_id = created["case"]["id"].as_str().unwrap().to_string();

    // One message exists before the subscription: the snapshot half.
    server
        .http
        .post(server.url(&format!("/api/cases/{case_id}/messages")))
        .bearer_auth(&client_token)
        .json(&serde_json::json!({ "content": "first message" }))
        .send()
        .await
        .unwrap();

    // The assigned agent opens the feed.
    let agent_token = sign_in(&server, AGENT_EMAIL, AGENT_PASSWORD).await;
    let feed = server
        .http
        .get(server.url(&format!("/api/cases/{case_id}/events")))
        .bearer_auth(&agent_token)
        .send()
        .await
        .unwrap();
    assert_eq!(feed.status(), 200);

    // Give the subscription a beat, then insert the live half.
    tokio::time::sleep(Duration::from_millis(100)).await;
    server
        .http
        .post(server.url(&format!("/api/cases/{case_id}/messages")))
        .bearer_auth(&client_token)
        .json(&serde_json::json!({ "content": "second message" }))
        .send()
        .await
        .unwrap();

    // Expect: snapshot message, live message, and a notification (the
    // author is the client, the viewer is the agent).
    let events = read_sse_events(feed, 3).await;
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["message", "message", "notification"]);
    assert_eq!(events[0].1["message"]["message_content"], "first message");
    assert_eq!(events[1].1["message"]["message_content"], "second message");
    assert_eq!(events[2].1["kind"], "message");

    // No duplicate ids across snapshot and live delivery.
    assert_ne!(
        events[0].1["message"]["id"],
        events[1].1["message"]["id"]
    );
}

#[tokio::test]
async fn live_feed_hides_internal_notes_from_clients() {
    let (ai_url, _) = start_mock_ai(MockAiBehavior::Assign {
        email: AGENT_EMAIL.to_string(),
    })
    .await;
    let server = start_test_server(&ai_url).await;

    let client_token = sign_up_client(&server, "client@example.com").await;
    let created = create_case(&server, &client_token).await;
    let case_id = created["case"]["id"].as_str().unwrap().to_string();

    let feed = server
        .http
        .get(server.url(&format!("/api/cases/{case_id}/events")))
        .bearer_auth(&client_token)
        .send()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    // The agent adds a note, then a message.
    let agent_token = sign_in(&server, AGENT_EMAIL, AGENT_PASSWORD).await;
    server
        .http
        .post(server.url(&format!("/api/cases/{case_id}/notes")))
        .bearer_auth(&agent_token)
        .json(&serde_json::json!({ "content": "privileged analysis" }))
        .send()
        .await
        .unwrap();
    server
        .http
        .post(server.url(&format!("/api/cases/{case_id}/messages")))
        .bearer_auth(&agent_token)
        .json(&serde_json::json!({ "content": "we are reviewing your file" }))
        .send()
        .await
        .unwrap();

    // The client's feed carries the message and its notification, never the
    // note.
    let events = read_sse_events(feed, 2).await;
    assert!(events.iter().all(|(name, _)| name != "internal_note"));
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["message", "notification"]);
}

#[tokio::test]
async fn session_endpoint_reflects_the_cached_identity() {
    let (ai_url, _) = start_mock_ai(MockAiBehavior::Fail {
        detail: "unused".to_string(),
    })
    .await;
    let server = start_test_server(&ai_url).await;

    let token = sign_up_client(&server, "client@example.com").await;
    let session: serde_json::Value = server
        .http
        .get(server.url("/api/auth/session"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(session["user"]["email"], "client@example.com");
    assert_eq!(session["user"]["role"], "client");

    // Logout invalidates the token.
    server
        .http
        .post(server.url("/api/auth/logout"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let response = server
        .http
        .get(server.url("/api/auth/session"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Shut the gateway down cleanly.
    if let Some(tx) = server.state.shutdown_tx.write().await.take() {
        let _ = tx.send(());
    }
}
