//! End-to-end onboarding over HTTP.
//!
//! Starts a fake extraction webhook and a fake PostgREST on ephemeral ports,
//! then the real service router pointed at them, and walks the wizard with
//! reqwest.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::{Multipart, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::timeout;

use safe_spot::config::AppConfig;
use safe_spot::server::{AppState, app_router};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const SERVICE_KEY: &str = "service-key";

// ── Fake collaborators ──────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Collaborators {
    webhook_calls: Arc<AtomicUsize>,
    filenames: Arc<Mutex<Vec<String>>>,
    registered_emails: Arc<Mutex<Vec<String>>>,
    inserted: Arc<Mutex<Vec<Value>>>,
    directory: Arc<Mutex<Vec<Value>>>,
}

async fn webhook(State(fake): State<Collaborators>, mut multipart: Multipart) -> Json<Value> {
    fake.webhook_calls.fetch_add(1, Ordering::SeqCst);
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().map(str::to_string);
        if name.as_deref() == Some("filename") {
            fake.filenames.lock().await.push(field.text().await.unwrap());
        }
    }
    // n8n wraps the result in a one-element array.
    Json(json!([{
        "nombre_completo": "Ana Pérez",
        "email": "ana@example.com",
        "telefono": null,
        "años_experiencia": 8,
        "especialidades": ["Ansiedad", "Duelo"],
        "modalidad": "online",
        "sobre_mi": "Psicóloga clínica",
        "formacion": ["Lic. en Psicología, UBA"]
    }]))
}

fn authorized(headers: &HeaderMap) -> bool {
    headers.get("apikey").and_then(|v| v.to_str().ok()) == Some(SERVICE_KEY)
        && headers.get("authorization").and_then(|v| v.to_str().ok())
            == Some(&format!("Bearer {SERVICE_KEY}")[..])
}

async fn select_psychologists(
    State(fake): State<Collaborators>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "no key" })));
    }
    let email = query
        .get("email")
        .and_then(|e| e.strip_prefix("eq."))
        .unwrap_or_default()
        .to_string();
    let rows = if fake.registered_emails.lock().await.contains(&email) {
        json!([{ "id": 1 }])
    } else {
        json!([])
    };
    (StatusCode::OK, Json(rows))
}

async fn insert_psychologist(
    State(fake): State<Collaborators>,
    headers: HeaderMap,
    Json(row): Json<Value>,
) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "no key" })));
    }
    assert_eq!(headers["prefer"], "return=representation");
    fake.inserted.lock().await.push(row.clone());
    let mut stored = row;
    stored["id"] = json!(42);
    (StatusCode::CREATED, Json(json!([stored])))
}

async fn insert_directory_entry(
    State(fake): State<Collaborators>,
    headers: HeaderMap,
    Json(row): Json<Value>,
) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "no key" })));
    }
    fake.directory.lock().await.push(row.clone());
    let mut stored = row;
    stored["id"] = json!(7);
    (StatusCode::CREATED, Json(json!([stored])))
}

async fn select_directory() -> Json<Value> {
    Json(json!([
        { "id": 7, "nombre": "Lic. Laura Gómez", "estado": "ACTIVO", "created_at": "2026-02-03T09:00:00Z" },
        { "id": 8, "nombre": "Lic. Pablo Díaz", "estado": "PENDIENTE", "created_at": null }
    ]))
}

async fn select_leads() -> Json<Value> {
    Json(json!([
        { "id": 1, "name": "Marta", "source": "whatsapp", "created_at": "2026-03-10" },
        { "id": 2, "name": "Juan", "source": "instagram", "created_at": "2026-03-09" }
    ]))
}

async fn start_collaborators() -> (u16, Collaborators) {
    let fake = Collaborators::default();
    let app = Router::new()
        .route("/webhook/cv", post(webhook))
        .route(
            "/rest/v1/psychologists",
            get(select_psychologists).post(insert_psychologist),
        )
        .route(
            "/rest/v1/perfiles_psicologos",
            get(select_directory).post(insert_directory_entry),
        )
        .route("/rest/v1/patient_leads", get(select_leads))
        .with_state(fake.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, fake)
}

// ── Service under test ──────────────────────────────────────────────────

async fn start_server() -> (String, Collaborators) {
    let (collab_port, fake) = start_collaborators().await;
    let vars: HashMap<&str, String> = HashMap::from([
        (
            "SAFESPOT_EXTRACTION_URL",
            format!("http://127.0.0.1:{collab_port}/webhook/cv"),
        ),
        ("SUPABASE_URL", format!("http://127.0.0.1:{collab_port}")),
        ("SUPABASE_SERVICE_ROLE_KEY", SERVICE_KEY.to_string()),
        ("SAFESPOT_PUBLIC_URL", "https://app.example".to_string()),
    ]);
    let config = AppConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
    let app = app_router(AppState::from_config(&config).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the servers a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), fake)
}

fn cv_form(content_type: &str) -> Form {
    let part = Part::bytes(b"%PDF-1.4 fake cv".to_vec())
        .file_name("upload.pdf")
        .mime_str(content_type)
        .unwrap();
    Form::new().part("cv", part).text("filename", "ana-cv.pdf")
}

async fn new_session(http: &reqwest::Client, base: &str) -> String {
    let resp = http
        .post(format!("{base}/api/onboarding/sessions"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["snapshot"]["step"], "awaiting_document");
    body["id"].as_str().unwrap().to_string()
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_wizard_to_calendar_handoff() {
    timeout(TEST_TIMEOUT, async {
        let (base, fake) = start_server().await;
        let http = reqwest::Client::new();
        let id = new_session(&http, &base).await;
        let session = format!("{base}/api/onboarding/sessions/{id}");

        // Upload
        let resp = http
            .post(format!("{session}/document"))
            .multipart(cv_form("application/pdf"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let snap: Value = resp.json().await.unwrap();
        assert_eq!(snap["step"], "reviewing_profile");
        assert_eq!(snap["profile"]["nombre_completo"], "Ana Pérez");
        assert_eq!(snap["profile"]["telefono"], "");
        assert_eq!(fake.filenames.lock().await.as_slice(), ["ana-cv.pdf"]);

        // Edit and submit in one call
        let mut edited = snap["profile"].clone();
        edited["telefono"] = json!("+54 11 5555 0000");
        let resp = http
            .post(format!("{session}/submit"))
            .json(&edited)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let snap: Value = resp.json().await.unwrap();
        assert_eq!(snap["step"], "awaiting_calendar_link");
        assert_eq!(snap["profile_id"], 42);

        let inserted = fake.inserted.lock().await.clone();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0]["name"], "Ana Pérez");
        assert_eq!(inserted[0]["phone"], "+54 11 5555 0000");
        assert_eq!(inserted[0]["session_duration"], 30);
        assert_eq!(inserted[0]["buffer_time"], 15);
        assert_eq!(inserted[0]["hourly_rate"], 100);
        assert_eq!(inserted[0]["currency"], "USD");
        assert_eq!(inserted[0]["is_active"], true);

        // Calendar handoff
        let resp = http
            .post(format!("{session}/calendar/connect"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let handoff: Value = resp.json().await.unwrap();
        assert_eq!(
            handoff["redirect_url"],
            "https://app.example/api/auth/google?psychologist_id=42&redirect=%2Fonboarding%2Fsuccess"
        );
        assert_eq!(handoff["snapshot"]["step"], "completed");
        assert_eq!(handoff["snapshot"]["calendar"], "connected");

        // Skipping afterwards changes nothing.
        let resp = http
            .post(format!("{session}/calendar/skip"))
            .send()
            .await
            .unwrap();
        let snap: Value = resp.json().await.unwrap();
        assert_eq!(snap["calendar"], "connected");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn wrong_media_type_never_reaches_webhook() {
    timeout(TEST_TIMEOUT, async {
        let (base, fake) = start_server().await;
        let http = reqwest::Client::new();
        let id = new_session(&http, &base).await;

        let resp = http
            .post(format!("{base}/api/onboarding/sessions/{id}/document"))
            .multipart(cv_form("image/png"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["snapshot"]["step"], "awaiting_document");
        assert!(body["snapshot"]["last_error"].as_str().unwrap().contains("image/png"));
        assert_eq!(fake.webhook_calls.load(Ordering::SeqCst), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn oversized_cv_is_refused_with_snapshot() {
    timeout(TEST_TIMEOUT, async {
        let (base, fake) = start_server().await;
        let http = reqwest::Client::new();
        let id = new_session(&http, &base).await;
        let session = format!("{base}/api/onboarding/sessions/{id}");

        let twelve_mib = vec![b'%'; 12 * 1024 * 1024];
        let part = Part::bytes(twelve_mib)
            .file_name("huge.pdf")
            .mime_str("application/pdf")
            .unwrap();
        let resp = http
            .post(format!("{session}/document"))
            .multipart(Form::new().part("cv", part))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["snapshot"]["step"], "awaiting_document");
        let last_error = body["snapshot"]["last_error"].as_str().unwrap();
        assert!(last_error.contains("12582912 bytes"), "{last_error}");
        assert!(last_error.contains("10485760"), "{last_error}");
        assert_eq!(fake.webhook_calls.load(Ordering::SeqCst), 0);

        // The session is still usable.
        let resp = http
            .post(format!("{session}/document"))
            .multipart(cv_form("application/pdf"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(fake.webhook_calls.load(Ordering::SeqCst), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn duplicate_email_is_a_conflict() {
    timeout(TEST_TIMEOUT, async {
        let (base, fake) = start_server().await;
        fake.registered_emails
            .lock()
            .await
            .push("ana@example.com".to_string());
        let http = reqwest::Client::new();
        let id = new_session(&http, &base).await;
        let session = format!("{base}/api/onboarding/sessions/{id}");

        http.post(format!("{session}/document"))
            .multipart(cv_form("application/pdf"))
            .send()
            .await
            .unwrap();
        let resp = http.post(format!("{session}/submit")).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["snapshot"]["step"], "reviewing_profile");
        assert!(fake.inserted.lock().await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn later_steps_are_unavailable_before_upload() {
    timeout(TEST_TIMEOUT, async {
        let (base, fake) = start_server().await;
        let http = reqwest::Client::new();
        let id = new_session(&http, &base).await;
        let session = format!("{base}/api/onboarding/sessions/{id}");

        for path in ["submit", "back", "calendar/connect", "calendar/skip"] {
            let resp = http.post(format!("{session}/{path}")).send().await.unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT, "{path}");
        }
        let snap: Value = http.get(&session).send().await.unwrap().json().await.unwrap();
        assert_eq!(snap["step"], "awaiting_document");
        assert_eq!(snap["actions"], json!(["select_document"]));
        assert!(fake.inserted.lock().await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn back_discards_the_extracted_profile() {
    timeout(TEST_TIMEOUT, async {
        let (base, fake) = start_server().await;
        let http = reqwest::Client::new();
        let id = new_session(&http, &base).await;
        let session = format!("{base}/api/onboarding/sessions/{id}");

        http.post(format!("{session}/document"))
            .multipart(cv_form("application/pdf"))
            .send()
            .await
            .unwrap();
        let snap: Value = http
            .post(format!("{session}/back"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(snap["step"], "awaiting_document");
        assert!(snap.get("profile").is_none());

        http.post(format!("{session}/document"))
            .multipart(cv_form("application/pdf"))
            .send()
            .await
            .unwrap();
        assert_eq!(fake.webhook_calls.load(Ordering::SeqCst), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn direct_registration_endpoints() {
    timeout(TEST_TIMEOUT, async {
        let (base, fake) = start_server().await;
        let http = reqwest::Client::new();

        let body: Value = http
            .get(format!("{base}/api/check-email?email=ana@example.com"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["exists"], false);

        let profile = json!({ "nombre_completo": "Ana Pérez", "email": "ana@example.com" });
        let resp = http
            .post(format!("{base}/api/psychologists"))
            .json(&profile)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["id"], 42);

        fake.registered_emails
            .lock()
            .await
            .push("ana@example.com".to_string());
        let resp = http
            .post(format!("{base}/api/psychologists"))
            .json(&profile)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);

        let resp = http
            .post(format!("{base}/api/psychologists"))
            .json(&json!({ "email": "x@example.com" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        let extracted: Value = http
            .post(format!("{base}/api/upload-cv"))
            .multipart(cv_form("application/pdf"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(extracted["email"], "ana@example.com");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn admin_profile_form_and_dashboard() {
    timeout(TEST_TIMEOUT, async {
        let (base, fake) = start_server().await;
        let http = reqwest::Client::new();

        let resp = http
            .post(format!("{base}/api/admin/profiles"))
            .form(&[
                ("nombre_completo", " Lic. Laura Gómez "),
                ("orientacion_clinica", "Cognitivo conductual"),
                ("especialidades", "ansiedad, duelo"),
                ("modalidad", "virtual"),
                ("zona", "Palermo"),
                ("estado_membresia", "on"),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
        let created: Value = resp.json().await.unwrap();
        assert_eq!(created["id"], 7);

        let stored = fake.directory.lock().await.clone();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["nombre_completo"], "Lic. Laura Gómez");
        assert_eq!(stored[0]["especialidades"], json!(["ansiedad", "duelo"]));
        assert_eq!(stored[0]["zona"], Value::Null);
        assert_eq!(stored[0]["estado_membresia"], true);

        let resp = http
            .post(format!("{base}/api/admin/profiles"))
            .form(&[("nombre_completo", "   "), ("modalidad", "presencial")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("nombre_completo"));
        assert_eq!(fake.directory.lock().await.len(), 1);

        // Patients and the email log are not served by the fake and show empty.
        let resp = http.get(format!("{base}/api/dashboard")).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let view: Value = resp.json().await.unwrap();
        assert_eq!(
            view["metrics"],
            json!({
                "total_leads": 2,
                "active_psychologists": 1,
                "whatsapp_leads": 1,
                "tally_leads": 0
            })
        );
        assert_eq!(view["leads"][0]["date"], "10/03/2026");
        assert_eq!(view["psychologists"][0]["date"], "03/02/2026");
        assert_eq!(view["psychologists"][1]["date"], "-");
        assert_eq!(view["patients"], json!([]));
        assert_eq!(view["email_logs"], json!([]));
    })
    .await
    .expect("test timed out");
}
