//! Classifier client integration tests
//!
//! Run `HttpClassifier` against a mock classification service served by
//! axum on an ephemeral local port.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cmod_ca::classifier::{Classifier, ClassifierError, HttpClassifier};
use cmod_ca::dom::MemoryDom;
use cmod_ca::identity::CommentId;
use cmod_ca::queue::QueueEntry;
use cmod_ca::{CommentModerator, Error};
use cmod_common::config::{DisplayConfig, TomlConfig};
use cmod_common::events::{EventBus, ModerationEvent};
use cmod_common::protocol::{Classification, ReportWordRequest};

/// Serve `app` on 127.0.0.1 and return its base URL
async fn spawn_mock(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Mock that answers every comment with `label`, echoing its id
fn labeling_service(label: &'static str, seen: Arc<Mutex<Vec<Value>>>) -> Router {
    Router::new().route(
        "/analyze",
        post(move |Json(body): Json<Value>| {
            let seen = Arc::clone(&seen);
            async move {
                let id = body["comments"][0]["id"].as_str().unwrap_or_default().to_string();
                seen.lock().unwrap().push(body);
                Json(json!({ "comments": [{ "id": id, "classification": label, "reason": "mock" }] }))
            }
        }),
    )
}

fn client(base: &str) -> HttpClassifier {
    HttpClassifier::new(base, Duration::from_secs(5)).unwrap()
}

fn entry(text: &str) -> QueueEntry {
    QueueEntry::new(
        CommentId::from_wire(format!("pseudo--abc--{}", text.replace(' ', ""))),
        text,
        "abc",
    )
}

#[tokio::test]
async fn test_classify_normal_sends_wire_request() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let base = spawn_mock(labeling_service("normal", Arc::clone(&seen))).await;

    let outcome = client(&base).classify(&entry("hello there")).await.unwrap();
    assert_eq!(outcome.classification, Classification::Normal);
    assert_eq!(outcome.identity.as_str(), "pseudo--abc--hellothere");
    assert_eq!(outcome.reason.as_deref(), Some("mock"));

    let requests = seen.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0],
        json!({ "comments": [{ "id": "pseudo--abc--hellothere", "text": "hello there", "streamId": "abc" }] })
    );
}

#[tokio::test]
async fn test_classify_korean_label() {
    let base = spawn_mock(labeling_service("혐오", Arc::new(Mutex::new(Vec::new())))).await;
    let outcome = client(&base).classify(&entry("bad")).await.unwrap();
    assert_eq!(outcome.classification, Classification::Flagged);
}

#[tokio::test]
async fn test_unrecognized_label_is_unknown() {
    let base = spawn_mock(labeling_service("spicy", Arc::new(Mutex::new(Vec::new())))).await;
    let outcome = client(&base).classify(&entry("hmm")).await.unwrap();
    assert_eq!(outcome.classification, Classification::Unknown);
}

#[tokio::test]
async fn test_server_error_is_transport_failure() {
    let app = Router::new().route(
        "/analyze",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "model not loaded") }),
    );
    let base = spawn_mock(app).await;

    let err = client(&base).classify(&entry("hello")).await.unwrap_err();
    assert_eq!(err, ClassifierError::HttpStatus(500, "model not loaded".to_string()));
    assert!(matches!(Error::from(err), Error::TransportFailure(_)));
}

#[tokio::test]
async fn test_unparsable_body_is_malformed() {
    let app = Router::new().route("/analyze", post(|| async { "definitely not json" }));
    let base = spawn_mock(app).await;

    let err = client(&base).classify(&entry("hello")).await.unwrap_err();
    assert!(matches!(err, ClassifierError::MalformedResponse(_)));
    assert!(matches!(Error::from(err), Error::MalformedResponse(_)));
}

#[tokio::test]
async fn test_empty_result_set_is_malformed() {
    let app = Router::new().route("/analyze", post(|| async { Json(json!({ "comments": [] })) }));
    let base = spawn_mock(app).await;

    let err = client(&base).classify(&entry("hello")).await.unwrap_err();
    assert!(matches!(err, ClassifierError::MalformedResponse(_)));
}

#[tokio::test]
async fn test_per_item_error_is_rejection() {
    let app = Router::new().route(
        "/analyze",
        post(|| async {
            Json(json!({ "comments": [{ "id": "pseudo--abc--hello", "error": "Analysis failed" }] }))
        }),
    );
    let base = spawn_mock(app).await;

    let err = client(&base).classify(&entry("hello")).await.unwrap_err();
    assert!(matches!(err, ClassifierError::Rejected { ref message, .. } if message == "Analysis failed"));
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    // Bind then release a port so nothing is listening on it
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(&format!("http://{}", addr))
        .classify(&entry("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClassifierError::Network(_)));
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_report_word() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);
    let app = Router::new().route(
        "/report_word",
        post(move |Json(body): Json<Value>| {
            let recorded = Arc::clone(&recorded);
            async move {
                recorded.lock().unwrap().push(body);
                StatusCode::OK
            }
        }),
    );
    let base = spawn_mock(app).await;

    let report = ReportWordRequest {
        word: "idiot".to_string(),
        reason: "insult".to_string(),
        context: "you are an idiot".to_string(),
    };
    client(&base).report_word(&report).await.unwrap();

    let bodies = seen.lock().unwrap();
    assert_eq!(
        bodies[0],
        json!({ "word": "idiot", "reason": "insult", "context": "you are an idiot" })
    );
}

#[tokio::test]
async fn test_report_word_failure_status() {
    let app = Router::new().route(
        "/report_word",
        post(|| async { (StatusCode::BAD_REQUEST, "missing word") }),
    );
    let base = spawn_mock(app).await;

    let report = ReportWordRequest {
        word: "idiot".to_string(),
        reason: "insult".to_string(),
        context: String::new(),
    };
    let err = client(&base).report_word(&report).await.unwrap_err();
    assert!(matches!(err, ClassifierError::HttpStatus(400, _)));
}

/// Full pipeline against the mock service: flagged words get censored
#[tokio::test]
async fn test_moderator_against_mock_service() {
    let app = Router::new().route(
        "/analyze",
        post(|Json(body): Json<Value>| async move {
            let comment = &body["comments"][0];
            let text = comment["text"].as_str().unwrap_or_default();
            let label = if text.contains("idiot") { "flagged" } else { "normal" };
            Json(json!({ "comments": [{ "id": comment["id"], "classification": label }] }))
        }),
    );
    let base = spawn_mock(app).await;

    let dom = MemoryDom::default();
    let nice = dom.add("great video, thanks");
    let rude = dom.add("what an idiot");
    let rude_again = dom.add("what an idiot");

    let bus = EventBus::new(256);
    let mut events = bus.subscribe();
    let classifier = Arc::new(client(&base));
    let moderator = CommentModerator::new(dom.clone(), classifier, "abc", &TomlConfig::default(), bus);

    let (_signals, signal_rx) = mpsc::channel(8);
    let (_actions, action_rx) = mpsc::channel(8);
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(moderator.run(signal_rx, action_rx, shutdown.clone()));

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(ModerationEvent::QueueDrained { completed, .. }) = events.recv().await {
                assert_eq!(completed, 2);
                break;
            }
        }
    })
    .await
    .unwrap();
    shutdown.cancel();
    let moderator = handle.await.unwrap();

    let censored = DisplayConfig::default().censored_text;
    assert_eq!(dom.visible_text(nice).unwrap(), "great video, thanks");
    assert_eq!(dom.visible_text(rude).unwrap(), censored);
    assert_eq!(dom.visible_text(rude_again).unwrap(), censored);
    assert_eq!(moderator.registry().counts().classified, 2);
}
