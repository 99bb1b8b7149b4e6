//! Multi-turn session context folding across sequential rounds.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::WsTokenizer;
use infbench::clock::RunClock;
use infbench::config::{ApiConfig, ApiType};
use infbench::data::{ChatMessage, Prompt, RequestDescriptor};
use infbench::lifecycle::{execute_request, EngineContext};
use infbench::session::UserSession;
use infbench::sink::Outcome;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn chat_engine(base_url: &str) -> EngineContext {
    EngineContext {
        clock: RunClock::start(),
        client: reqwest::Client::new(),
        api: ApiConfig {
            api_type: ApiType::Chat,
            streaming: false,
            ignore_eos: true,
        },
        endpoint: format!("{base_url}/v1/chat/completions"),
        timeout: Duration::from_secs(5),
        tokenizer: Arc::new(WsTokenizer),
    }
}

fn round(session: &Arc<UserSession>, text: &str) -> RequestDescriptor {
    RequestDescriptor {
        prompt: Prompt::Chat {
            messages: vec![ChatMessage::user(text)],
        },
        max_tokens: 8,
        ttft_slo_sec: None,
        tpot_slo_sec: None,
        session: Some(Arc::clone(session)),
    }
}

#[tokio::test]
async fn chat_rounds_accumulate_history_on_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "reply"}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        })))
        .mount(&server)
        .await;

    let ctx = chat_engine(&server.uri());
    let session = UserSession::new("s0".into(), ApiType::Chat, 0);
    let cancel = CancellationToken::new();

    let r1 = execute_request(&ctx, round(&session, "q1"), "m", 0, 0.0, &cancel).await;
    let r2 = execute_request(&ctx, round(&session, "q2"), "m", 0, 0.1, &cancel).await;
    assert_eq!(r1.outcome, Outcome::Success);
    assert_eq!(r2.outcome, Outcome::Success);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);

    let first: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(first["messages"].as_array().unwrap().len(), 1);
    assert_eq!(first["messages"][0]["content"], "q1");

    // Round two carries the folded history: q1, reply, q2.
    let second: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    let messages = second["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["content"], "q1");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[2]["content"], "q2");
}

#[tokio::test]
async fn failed_round_leaves_context_untouched() {
    let server = MockServer::start().await;
    let failing = Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount_as_scoped(&server)
        .await;

    let ctx = chat_engine(&server.uri());
    let session = UserSession::new("s1".into(), ApiType::Chat, 0);
    let cancel = CancellationToken::new();

    let r1 = execute_request(&ctx, round(&session, "q1"), "m", 0, 0.0, &cancel).await;
    assert_eq!(r1.outcome, Outcome::ServerError);
    drop(failing);

    // Next round must not see any history from the failed round.
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}}]
        })))
        .mount(&server)
        .await;

    let r2 = execute_request(&ctx, round(&session, "q2"), "m", 0, 0.1, &cancel).await;
    assert_eq!(r2.outcome, Outcome::Success);

    let requests = server.received_requests().await.unwrap();
    let last: serde_json::Value =
        serde_json::from_slice(&requests.last().unwrap().body).unwrap();
    let messages = last["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "q2");
}
