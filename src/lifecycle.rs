use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::clock::RunClock;
use crate::config::ApiConfig;
use crate::data::{ChatMessage, Prompt, RequestDescriptor};
use crate::error::RequestError;
use crate::session::{update_chat_context, update_text_context, SessionContext, SessionState};
use crate::sink::{LifecycleRecord, Outcome};
use crate::tokenizer::Tokenizer;

/// Everything one worker needs to execute requests. Built once per worker;
/// the client (and its connection pool) is never shared across workers.
pub struct EngineContext {
    pub clock: RunClock,
    pub client: reqwest::Client,
    pub api: ApiConfig,
    pub endpoint: String,
    pub timeout: Duration,
    pub tokenizer: Arc<dyn Tokenizer>,
}

/// Timestamps stamped while bytes arrive, not after parsing completes.
#[derive(Debug, Default, Clone, Copy)]
struct Timings {
    first_byte: Option<f64>,
    first_token: Option<f64>,
    last_token: Option<f64>,
}

/// Parsed response content plus token accounting.
struct ResponseData {
    text: String,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

/// What was actually sent, for session context folding and input-token
/// counting when the server omits usage.
enum SentContent {
    Text(String),
    Messages(Vec<ChatMessage>),
}

/// Execute one request end to end and produce exactly one lifecycle record.
///
/// This function never fails upward: timeouts, transport errors, non-2xx
/// statuses, and cancellation all fold into the record's outcome. For
/// session descriptors the session is held from payload construction until
/// the context update, which serializes rounds FIFO.
pub async fn execute_request(
    ctx: &EngineContext,
    descriptor: RequestDescriptor,
    model: &str,
    stage_id: u32,
    scheduled_time: f64,
    cancel: &CancellationToken,
) -> LifecycleRecord {
    let mut session_guard = match &descriptor.session {
        Some(session) => Some(session.begin_round().await),
        None => None,
    };

    let dispatch_time = ctx.clock.now();
    let (body, sent) = build_payload(
        &descriptor,
        session_guard.as_deref().map(|s| &s.context),
        model,
        &ctx.api,
    );

    let mut timings = Timings::default();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RequestError::Canceled),
        r = tokio::time::timeout(ctx.timeout, perform(ctx, &body, &mut timings)) => {
            match r {
                Ok(inner) => inner,
                Err(_) => Err(RequestError::Timeout),
            }
        }
    };
    let completion_time = ctx.clock.now();

    // Fold the round into the session before releasing it. Failed rounds
    // keep the previous context.
    if let Some(state) = session_guard.as_deref_mut() {
        if let Ok(data) = &result {
            match &sent {
                SentContent::Text(prompt) => update_text_context(state, prompt, &data.text),
                SentContent::Messages(messages) => {
                    update_chat_context(state, messages, &data.text)
                }
            }
        }
    }
    drop(session_guard);

    let input_fallback = || match &sent {
        SentContent::Text(prompt) => ctx.tokenizer.count_tokens(prompt),
        SentContent::Messages(messages) => messages
            .iter()
            .map(|m| ctx.tokenizer.count_tokens(&m.content))
            .sum(),
    };

    match result {
        Ok(data) => LifecycleRecord {
            stage_id,
            model_name: model.to_string(),
            scheduled_time,
            dispatch_time,
            first_byte_time: timings.first_byte,
            first_token_time: timings.first_token,
            last_token_time: timings.last_token,
            completion_time,
            input_tokens: data.input_tokens.or_else(|| Some(input_fallback())),
            output_tokens: data.output_tokens,
            outcome: Outcome::Success,
            error_detail: None,
            ttft_slo_sec: descriptor.ttft_slo_sec,
            tpot_slo_sec: descriptor.tpot_slo_sec,
        },
        Err(err) => {
            tracing::debug!(
                stage = stage_id,
                model = model,
                error = %err,
                "request failed"
            );
            LifecycleRecord {
                stage_id,
                model_name: model.to_string(),
                scheduled_time,
                dispatch_time,
                first_byte_time: timings.first_byte,
                first_token_time: timings.first_token,
                last_token_time: timings.last_token,
                completion_time,
                input_tokens: None,
                output_tokens: None,
                outcome: err.outcome(),
                error_detail: Some(err.detail()),
                ttft_slo_sec: descriptor.ttft_slo_sec,
                tpot_slo_sec: descriptor.tpot_slo_sec,
            }
        }
    }
}

/// Build the OpenAI-compatible JSON body, folding session context in.
fn build_payload(
    descriptor: &RequestDescriptor,
    context: Option<&SessionContext>,
    model: &str,
    api: &ApiConfig,
) -> (Value, SentContent) {
    match &descriptor.prompt {
        Prompt::Completion { prompt } => {
            let full_prompt = match context {
                Some(SessionContext::Text(ctx)) if !ctx.is_empty() => format!("{ctx} {prompt}"),
                _ => prompt.clone(),
            };
            let mut body = json!({
                "model": model,
                "prompt": &full_prompt,
                "max_tokens": descriptor.max_tokens,
                "ignore_eos": api.ignore_eos,
                "stream": api.streaming,
            });
            if api.streaming {
                body["stream_options"] = json!({"include_usage": true});
            }
            (body, SentContent::Text(full_prompt))
        }
        Prompt::Chat { messages } => {
            let full_messages: Vec<ChatMessage> = match context {
                Some(SessionContext::Messages(history)) if !history.is_empty() => history
                    .iter()
                    .cloned()
                    .chain(messages.iter().filter(|m| m.role != "system").cloned())
                    .collect(),
                _ => messages.clone(),
            };
            let mut body = json!({
                "model": model,
                "messages": &full_messages,
                "max_tokens": descriptor.max_tokens,
                "ignore_eos": api.ignore_eos,
                "stream": api.streaming,
            });
            if api.streaming {
                body["stream_options"] = json!({"include_usage": true});
            }
            (body, SentContent::Messages(full_messages))
        }
    }
}

async fn perform(
    ctx: &EngineContext,
    body: &Value,
    timings: &mut Timings,
) -> Result<ResponseData, RequestError> {
    let resp = ctx
        .client
        .post(&ctx.endpoint)
        .json(body)
        .send()
        .await
        .map_err(RequestError::from_reqwest)?;

    timings.first_byte = Some(ctx.clock.now());

    let status = resp.status();
    if !status.is_success() {
        return Err(RequestError::Http(status.as_u16()));
    }

    if ctx.api.streaming {
        read_streaming(ctx, resp, timings).await
    } else {
        read_unary(ctx, resp).await
    }
}

async fn read_unary(
    ctx: &EngineContext,
    resp: reqwest::Response,
) -> Result<ResponseData, RequestError> {
    let bytes = resp.bytes().await.map_err(RequestError::from_reqwest)?;
    let parsed: ApiResponse = serde_json::from_slice(&bytes)
        .map_err(|e| RequestError::Malformed(e.to_string()))?;

    let text = parsed
        .choices
        .first()
        .map(|c| c.content_text())
        .unwrap_or_default();
    let usage = parsed.usage.unwrap_or_default();
    let output_tokens = usage
        .completion_tokens
        .unwrap_or_else(|| ctx.tokenizer.count_tokens(&text));
    Ok(ResponseData {
        input_tokens: usage.prompt_tokens,
        output_tokens: Some(output_tokens),
        text,
    })
}

async fn read_streaming(
    ctx: &EngineContext,
    resp: reqwest::Response,
    timings: &mut Timings,
) -> Result<ResponseData, RequestError> {
    let mut stream = resp.bytes_stream();
    let mut parser = SseParser::new();
    let mut text = String::new();
    let mut counted_tokens = 0u32;
    let mut usage = Usage::default();

    'read: while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(RequestError::from_reqwest)?;
        // Stamp at byte arrival; everything below is parsing.
        let arrived = ctx.clock.now();

        for data in parser.push(&chunk) {
            if data == SSE_DONE {
                break 'read;
            }
            let Ok(event) = serde_json::from_str::<ApiResponse>(&data) else {
                continue;
            };
            if let Some(delta) = event.choices.first().map(|c| c.content_text()) {
                if !delta.is_empty() {
                    if timings.first_token.is_none() {
                        timings.first_token = Some(arrived);
                    }
                    timings.last_token = Some(arrived);
                    counted_tokens += ctx.tokenizer.count_tokens(&delta);
                    text.push_str(&delta);
                }
            }
            // The final event typically carries cumulative usage; keep the
            // last one seen.
            if let Some(u) = event.usage {
                usage = u;
            }
        }
    }

    let output_tokens = match usage.completion_tokens {
        Some(n) if n > 0 => Some(n),
        _ if timings.first_token.is_some() => Some(counted_tokens.max(1)),
        _ => None,
    };
    Ok(ResponseData {
        input_tokens: usage.prompt_tokens,
        output_tokens,
        text,
    })
}

const SSE_DONE: &str = "[DONE]";

/// Incremental SSE line parser.
///
/// Feed raw chunks as they arrive; get back the `data:` payloads completed
/// by that chunk. Partial lines are buffered, never dropped, so events split
/// across TCP segments are reassembled without buffering the whole body.
pub struct SseParser {
    buf: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            let Some(data) = line
                .strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
            else {
                continue;
            };
            let data = data.trim();
            if !data.is_empty() {
                events.push(data.to_string());
            }
        }
        events
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Covers both the unary response and streamed chunks of both API flavors.
#[derive(Debug, Default, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message: Option<MessageContent>,
    #[serde(default)]
    delta: Option<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

impl Choice {
    fn content_text(&self) -> String {
        if let Some(text) = &self.text {
            return text.clone();
        }
        if let Some(m) = &self.message {
            return m.content.clone().unwrap_or_default();
        }
        if let Some(d) = &self.delta {
            return d.content.clone().unwrap_or_default();
        }
        String::new()
    }
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiType;

    #[test]
    fn sse_parser_handles_split_events() {
        let mut parser = SseParser::new();
        let first = parser.push(b"data: {\"choices\":[{\"te");
        assert!(first.is_empty());
        let second = parser.push(b"xt\":\"hi\"}]}\n\ndata: [DONE]\n\n");
        assert_eq!(second.len(), 2);
        assert!(second[0].contains("\"hi\""));
        assert_eq!(second[1], "[DONE]");
    }

    #[test]
    fn sse_parser_accepts_prefix_without_space() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data:{\"x\":1}\n");
        assert_eq!(events, vec!["{\"x\":1}".to_string()]);
    }

    #[test]
    fn sse_parser_ignores_comments_and_event_lines() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keepalive\nevent: delta\ndata: {\"y\":2}\n\n");
        assert_eq!(events, vec!["{\"y\":2}".to_string()]);
    }

    #[test]
    fn sse_parser_handles_crlf() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: one\r\ndata: two\r\n\r\n");
        assert_eq!(events, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn completion_chunk_content_extraction() {
        let event: ApiResponse =
            serde_json::from_str(r#"{"choices":[{"text":"abc"}]}"#).unwrap();
        assert_eq!(event.choices[0].content_text(), "abc");
    }

    #[test]
    fn chat_delta_content_extraction() {
        let event: ApiResponse =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"xyz"}}]}"#).unwrap();
        assert_eq!(event.choices[0].content_text(), "xyz");
    }

    #[test]
    fn chat_role_only_delta_is_empty() {
        let event: ApiResponse =
            serde_json::from_str(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap();
        assert_eq!(event.choices[0].content_text(), "");
    }

    #[test]
    fn usage_on_final_event() {
        let event: ApiResponse = serde_json::from_str(
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":34}}"#,
        )
        .unwrap();
        let usage = event.usage.unwrap();
        assert_eq!(usage.prompt_tokens, Some(12));
        assert_eq!(usage.completion_tokens, Some(34));
    }

    #[test]
    fn completion_payload_shape() {
        let descriptor = RequestDescriptor {
            prompt: Prompt::Completion {
                prompt: "hello".into(),
            },
            max_tokens: 64,
            ttft_slo_sec: None,
            tpot_slo_sec: None,
            session: None,
        };
        let api = ApiConfig {
            api_type: ApiType::Completion,
            streaming: true,
            ignore_eos: true,
        };
        let (body, _) = build_payload(&descriptor, None, "m1", &api);
        assert_eq!(body["model"], "m1");
        assert_eq!(body["prompt"], "hello");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["stream"], true);
        assert_eq!(body["ignore_eos"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn chat_payload_prepends_session_history() {
        let descriptor = RequestDescriptor {
            prompt: Prompt::Chat {
                messages: vec![ChatMessage::user("next")],
            },
            max_tokens: 32,
            ttft_slo_sec: None,
            tpot_slo_sec: None,
            session: None,
        };
        let api = ApiConfig {
            api_type: ApiType::Chat,
            streaming: false,
            ignore_eos: false,
        };
        let history = SessionContext::Messages(vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
        ]);
        let (body, sent) = build_payload(&descriptor, Some(&history), "m", &api);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["content"], "first");
        assert_eq!(messages[2]["content"], "next");
        assert!(body.get("stream_options").is_none());
        match sent {
            SentContent::Messages(m) => assert_eq!(m.len(), 3),
            _ => panic!("expected messages"),
        }
    }

    #[test]
    fn completion_payload_prepends_text_context() {
        let descriptor = RequestDescriptor {
            prompt: Prompt::Completion {
                prompt: "q2".into(),
            },
            max_tokens: 8,
            ttft_slo_sec: None,
            tpot_slo_sec: None,
            session: None,
        };
        let api = ApiConfig {
            api_type: ApiType::Completion,
            streaming: false,
            ignore_eos: true,
        };
        let context = SessionContext::Text("q1 a1".into());
        let (body, _) = build_payload(&descriptor, Some(&context), "m", &api);
        assert_eq!(body["prompt"], "q1 a1 q2");
    }
}
