//! OpenAI-compatible mock inference server.
//!
//! Serves `/v1/completions` and `/v1/chat/completions` with configurable
//! first-token delay, inter-token delay, response length, and failure
//! injection, in both SSE streaming and unary modes. Exposes its own
//! Prometheus metrics at `/metrics` so the scrape path can be exercised
//! end to end without a real model server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

lazy_static! {
    static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "infbench_mock_requests_total",
        "Total requests served per model",
        &["model_name"]
    )
    .unwrap();

    static ref ACTIVE_REQUESTS: GaugeVec = register_gauge_vec!(
        "infbench_mock_active_requests",
        "Requests currently being generated per model",
        &["model_name"]
    )
    .unwrap();

    static ref TTFT_SECONDS: HistogramVec = register_histogram_vec!(
        "infbench_mock_ttft_seconds",
        "Simulated time to first token per model",
        &["model_name"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();

    static ref E2E_LATENCY_SECONDS: HistogramVec = register_histogram_vec!(
        "infbench_mock_e2e_latency_seconds",
        "End-to-end generation latency per model",
        &["model_name"],
        vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    static ref PROMPT_TOKENS_TOTAL: CounterVec = register_counter_vec!(
        "infbench_mock_prompt_tokens_total",
        "Prompt tokens consumed per model",
        &["model_name"]
    )
    .unwrap();

    static ref GENERATION_TOKENS_TOTAL: CounterVec = register_counter_vec!(
        "infbench_mock_generation_tokens_total",
        "Tokens generated per model",
        &["model_name"]
    )
    .unwrap();
}

/// Behavior knobs for the simulated server.
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// Delay before the first token, milliseconds.
    pub ttft_ms: u64,
    /// Delay between subsequent tokens, milliseconds.
    pub itl_ms: u64,
    /// Tokens generated per response (capped by the request's max_tokens).
    pub tokens: u32,
    /// Probability of answering 500 instead of generating.
    pub fail_rate: f64,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            ttft_ms: 50,
            itl_ms: 10,
            tokens: 10,
            fail_rate: 0.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MockRequest {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    messages: Option<Vec<MockMessage>>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct MockMessage {
    #[serde(default)]
    content: String,
}

pub fn router(config: MockServerConfig) -> Router {
    let state = Arc::new(config);
    Router::new()
        .route("/v1/completions", post(completions))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

async fn completions(
    State(config): State<Arc<MockServerConfig>>,
    Json(req): Json<MockRequest>,
) -> Response {
    serve(config, req, false).await
}

async fn chat_completions(
    State(config): State<Arc<MockServerConfig>>,
    Json(req): Json<MockRequest>,
) -> Response {
    serve(config, req, true).await
}

async fn serve(config: Arc<MockServerConfig>, req: MockRequest, chat: bool) -> Response {
    let model = req.model.clone().unwrap_or_else(|| "mock".to_string());
    REQUESTS_TOTAL.with_label_values(&[&model]).inc();

    if config.fail_rate > 0.0 && rand::thread_rng().gen::<f64>() < config.fail_rate {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": {"message": "injected failure", "type": "server_error"}})),
        )
            .into_response();
    }

    let prompt_tokens = estimate_prompt_tokens(&req);
    let tokens = match req.max_tokens {
        Some(max) if max > 0 => config.tokens.min(max),
        _ => config.tokens,
    };
    PROMPT_TOKENS_TOTAL
        .with_label_values(&[&model])
        .inc_by(prompt_tokens as f64);

    if req.stream {
        stream_response(config, model, prompt_tokens, tokens, chat)
    } else {
        unary_response(config, model, prompt_tokens, tokens, chat).await
    }
}

/// Whitespace token estimate; the harness trusts reported usage anyway.
fn estimate_prompt_tokens(req: &MockRequest) -> u32 {
    if let Some(prompt) = &req.prompt {
        return prompt.split_whitespace().count() as u32;
    }
    if let Some(messages) = &req.messages {
        return messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u32)
            .sum();
    }
    0
}

async fn unary_response(
    config: Arc<MockServerConfig>,
    model: String,
    prompt_tokens: u32,
    tokens: u32,
    chat: bool,
) -> Response {
    ACTIVE_REQUESTS.with_label_values(&[&model]).inc();
    let started = Instant::now();

    let total_ms = config.ttft_ms + config.itl_ms * tokens.saturating_sub(1) as u64;
    tokio::time::sleep(Duration::from_millis(total_ms)).await;

    let text: String = (0..tokens).map(|i| format!("tok{i} ")).collect();
    let body = if chat {
        json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "model": &model,
            "choices": [{"index": 0, "message": {"role": "assistant", "content": text},
                          "finish_reason": "length"}],
            "usage": {"prompt_tokens": prompt_tokens, "completion_tokens": tokens,
                       "total_tokens": prompt_tokens + tokens},
        })
    } else {
        json!({
            "id": "cmpl-mock",
            "object": "text_completion",
            "model": &model,
            "choices": [{"index": 0, "text": text, "finish_reason": "length"}],
            "usage": {"prompt_tokens": prompt_tokens, "completion_tokens": tokens,
                       "total_tokens": prompt_tokens + tokens},
        })
    };

    TTFT_SECONDS
        .with_label_values(&[&model])
        .observe(config.ttft_ms as f64 / 1000.0);
    E2E_LATENCY_SECONDS
        .with_label_values(&[&model])
        .observe(started.elapsed().as_secs_f64());
    GENERATION_TOKENS_TOTAL
        .with_label_values(&[&model])
        .inc_by(tokens as f64);
    ACTIVE_REQUESTS.with_label_values(&[&model]).dec();

    Json(body).into_response()
}

fn stream_response(
    config: Arc<MockServerConfig>,
    model: String,
    prompt_tokens: u32,
    tokens: u32,
    chat: bool,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(16);

    tokio::spawn(async move {
        ACTIVE_REQUESTS.with_label_values(&[&model]).inc();
        let started = Instant::now();

        tokio::time::sleep(Duration::from_millis(config.ttft_ms)).await;
        TTFT_SECONDS
            .with_label_values(&[&model])
            .observe(started.elapsed().as_secs_f64());

        for i in 0..tokens {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(config.itl_ms)).await;
            }
            let chunk = if chat {
                json!({"id": "chatcmpl-mock", "object": "chat.completion.chunk",
                        "choices": [{"index": 0, "delta": {"content": format!("tok{i} ")}}]})
            } else {
                json!({"id": "cmpl-mock", "object": "text_completion",
                        "choices": [{"index": 0, "text": format!("tok{i} ")}]})
            };
            if tx
                .send(Ok(Bytes::from(format!("data: {chunk}\n\n"))))
                .await
                .is_err()
            {
                // Client went away mid-stream.
                ACTIVE_REQUESTS.with_label_values(&[&model]).dec();
                return;
            }
        }

        let usage = json!({"choices": [],
            "usage": {"prompt_tokens": prompt_tokens, "completion_tokens": tokens,
                       "total_tokens": prompt_tokens + tokens}});
        let _ = tx
            .send(Ok(Bytes::from(format!("data: {usage}\n\n"))))
            .await;
        let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;

        E2E_LATENCY_SECONDS
            .with_label_values(&[&model])
            .observe(started.elapsed().as_secs_f64());
        GENERATION_TOKENS_TOTAL
            .with_label_values(&[&model])
            .inc_by(tokens as f64);
        ACTIVE_REQUESTS.with_label_values(&[&model]).dec();
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}

async fn metrics_handler() -> Response {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "encode error").into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// Bind the mock server on an ephemeral port and serve it in the
/// background. Returns the base URL. Used by integration tests.
pub async fn spawn(config: MockServerConfig) -> anyhow::Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router(config)).await {
            tracing::error!(error = %err, "mock server exited");
        }
    });
    Ok(format!("http://{addr}"))
}
