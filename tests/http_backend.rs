//! End-to-end tests of the HTTP backend client against an in-process stub server.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use brave_playground::backend::types::ReplyRequest;
use brave_playground::{
    ChatBackend, ConversationId, HttpBackend, Playground, PlaygroundConfig, ReplyMode, Role,
    SessionOutcome,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Default)]
struct StubState {
    conversations: serde_json::Map<String, Value>,
    next_id: u32,
    reply_requests: Vec<Value>,
    added: Vec<Value>,
    orders: Vec<Value>,
    images: Vec<String>,
    deleted_images: Vec<String>,
}

type Shared = Arc<Mutex<StubState>>;

fn lock(state: &Shared) -> MutexGuard<'_, StubState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn reply(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let query = body["query"].as_str().unwrap_or_default().to_string();
    {
        let mut stub = lock(&state);
        stub.reply_requests.push(body);
        if query.contains("draw") {
            stub.images.push("chart.png".to_string());
        }
    }
    if query == "explode" {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    // "café" split inside its two-byte "é".
    let mut chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
        Ok(b"Bonjour, caf".to_vec()),
        Ok(vec![0xC3]),
        Ok(vec![0xA9, b'!']),
    ];
    if query == "break" {
        chunks.truncate(1);
        chunks.push(Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "agent crashed",
        )));
    }
    Body::from_stream(futures::stream::iter(chunks)).into_response()
}

async fn conversations(State(state): State<Shared>) -> Json<Value> {
    Json(Value::Object(lock(&state).conversations.clone()))
}

async fn new_conversation(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let name = body["name"].as_str().unwrap_or_default().to_string();
    let mut stub = lock(&state);
    stub.next_id += 1;
    let id = format!("c{}", stub.next_id);
    stub.conversations
        .insert(id.clone(), json!({ "name": name, "messages": [] }));
    Json(json!({ "id": id, "name": name }))
}

async fn delete_conversation(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let id = body["id"].as_str().unwrap_or_default().to_string();
    lock(&state).conversations.remove(&id);
    Json(json!({ "status": "deleted" }))
}

async fn add_message(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    lock(&state).added.push(body);
    Json(json!({ "status": "ok" }))
}

async fn save_order(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    lock(&state).orders.push(body);
    Json(json!({ "status": "ok" }))
}

async fn images_list(State(state): State<Shared>) -> Json<Value> {
    Json(json!({ "images": lock(&state).images.clone() }))
}

async fn delete_image(State(state): State<Shared>, Path(name): Path<String>) -> StatusCode {
    let mut stub = lock(&state);
    stub.images.retain(|image| image != &name);
    stub.deleted_images.push(name);
    StatusCode::NO_CONTENT
}

async fn echo(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({ "query": body["query"], "k": body["k"], "results": [] }))
}

async fn spawn_stub(state: Shared) -> std::io::Result<String> {
    let app = Router::new()
        .route("/search", post(reply))
        .route("/plan", post(reply))
        .route("/conversations", get(conversations))
        .route("/conversation/new", post(new_conversation))
        .route("/conversation/delete", post(delete_conversation))
        .route("/conversation/add_message", post(add_message))
        .route("/conversations/order", post(save_order))
        .route("/images_list", get(images_list))
        .route("/images/{name}", delete(delete_image))
        .route("/news", post(echo))
        .route("/links", post(echo))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}/"))
}

async fn start() -> Result<(Shared, PlaygroundConfig), std::io::Error> {
    let state = Shared::default();
    let url = spawn_stub(Arc::clone(&state)).await?;
    Ok((state, PlaygroundConfig::new().with_backend_url(url)))
}

#[tokio::test]
async fn test_reply_stream_is_cumulative_and_utf8_safe() -> TestResult {
    let (_state, config) = start().await?;
    let backend = HttpBackend::new(config)?;

    let request = ReplyRequest {
        query: "hello".to_string(),
        chat_history: Vec::new(),
    };
    let chunks: Vec<_> = backend
        .open_reply(ReplyMode::Search, request)
        .await?
        .collect()
        .await;

    let texts: Vec<String> = chunks
        .into_iter()
        .map(|chunk| chunk.map(|c| (c.text, c.done)))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(text, done)| {
            assert!(!text.contains('\u{FFFD}'));
            if done { format!("{text}|done") } else { text }
        })
        .collect();

    assert_eq!(texts.last().map(String::as_str), Some("Bonjour, café!|done"));
    for text in &texts {
        assert!("Bonjour, café!|done".starts_with(text.as_str()));
    }
    Ok(())
}

#[tokio::test]
async fn test_send_streams_persists_and_attributes_images() -> TestResult {
    let (state, config) = start().await?;
    {
        let mut stub = lock(&state);
        stub.conversations.insert(
            "a".to_string(),
            json!({ "name": "Alpha", "messages": [], "order": 1 }),
        );
        stub.conversations
            .insert("b".to_string(), json!({ "name": "Beta" }));
        stub.images.push("old.png".to_string());
    }

    let playground = Playground::new(config)?;
    let loaded = playground.load().await?;
    assert_eq!(loaded.len(), 2);
    assert_eq!(playground.store().active(), Some(ConversationId::from("a")));

    let outcome = playground.send("draw me a chart").await?;
    assert_eq!(
        outcome,
        SessionOutcome::Completed {
            content: "Bonjour, café!".to_string(),
            images: vec!["chart.png".to_string()],
        }
    );

    let shown = playground.active().map(|c| c.messages).unwrap_or_default();
    assert_eq!(shown.len(), 2);
    assert_eq!(shown[0].role, Role::User);
    assert_eq!(shown[1].content, "Bonjour, café!");
    assert_eq!(shown[1].images, vec!["chart.png".to_string()]);

    let stub = lock(&state);
    assert_eq!(stub.reply_requests.len(), 1);
    assert_eq!(stub.reply_requests[0]["chat_history"], json!([]));
    assert_eq!(stub.added.len(), 2);
    assert_eq!(stub.added[0]["id"], json!("a"));
    assert_eq!(stub.added[0]["message"]["role"], json!("user"));
    assert_eq!(stub.added[1]["message"]["role"], json!("assistant"));
    assert_eq!(stub.added[1]["message"]["images"], json!(["chart.png"]));
    drop(stub);

    let url = playground.manager().image_url("chart.png")?;
    assert!(url.as_str().ends_with("/images/chart.png"));
    Ok(())
}

#[tokio::test]
async fn test_server_error_becomes_fallback_reply() -> TestResult {
    let (state, config) = start().await?;
    lock(&state)
        .conversations
        .insert("a".to_string(), json!({ "name": "Alpha", "messages": [] }));
    let playground = Playground::new(config.clone())?;
    playground.load().await?;

    let outcome = playground.send("explode").await?;
    assert_eq!(
        outcome,
        SessionOutcome::Failed {
            message: config.error_message.clone()
        }
    );
    let last = playground
        .active()
        .and_then(|c| c.messages.last().map(|m| m.content.clone()));
    assert_eq!(last, Some(config.error_message));
    assert!(!playground.is_loading(&ConversationId::from("a")));
    Ok(())
}

#[tokio::test]
async fn test_broken_stream_becomes_fallback_reply() -> TestResult {
    let (state, config) = start().await?;
    lock(&state)
        .conversations
        .insert("a".to_string(), json!({ "name": "Alpha", "messages": [] }));
    let playground = Playground::new(config.clone())?;
    playground.load().await?;

    let outcome = playground.send_with_mode("break", ReplyMode::Plan).await?;
    assert!(matches!(outcome, SessionOutcome::Failed { .. }));
    // Only the user message reaches the backend.
    assert_eq!(lock(&state).added.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_conversation_lifecycle() -> TestResult {
    let (state, config) = start().await?;
    lock(&state).images.push("old.png".to_string());
    let playground = Playground::new(config)?;
    playground.load().await?;

    let first = playground.manager().create("Trips").await?;
    let second = playground.manager().create("Recipes").await?;
    assert_eq!(playground.store().active(), Some(second.id.clone()));

    let order = playground
        .manager()
        .reorder(std::slice::from_ref(&second.id))
        .await?;
    assert_eq!(order, vec![second.id.clone(), first.id.clone()]);
    assert_eq!(
        lock(&state).orders.last().cloned(),
        Some(json!({ "order": [second.id.as_str(), first.id.as_str()] }))
    );

    playground.manager().delete(&second.id).await?;
    assert_eq!(playground.store().active(), Some(first.id.clone()));
    assert!(!lock(&state).conversations.contains_key(second.id.as_str()));

    assert_eq!(playground.manager().list_images().await?, vec!["old.png".to_string()]);
    playground.manager().delete_image("old.png").await?;
    assert_eq!(lock(&state).deleted_images, vec!["old.png".to_string()]);
    assert_eq!(playground.store().image_snapshot(), Some(Vec::new()));
    Ok(())
}

#[tokio::test]
async fn test_news_and_links_pass_through() -> TestResult {
    let (_state, config) = start().await?;
    let playground = Playground::new(config)?;

    let news = playground.news("rust 2024").await?;
    assert_eq!(news["query"], json!("rust 2024"));
    assert_eq!(news["k"], json!(5));

    let links = playground.links("tokio").await?;
    assert_eq!(links["results"], json!([]));
    Ok(())
}
