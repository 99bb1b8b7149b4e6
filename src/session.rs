use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::ApiType;
use crate::data::ChatMessage;

/// Accumulated conversation context for one user session.
///
/// The variant is fixed by the API type for the whole run: completion
/// sessions concatenate text, chat sessions grow a message history. The two
/// are never mixed.
#[derive(Debug, Clone)]
pub enum SessionContext {
    Text(String),
    Messages(Vec<ChatMessage>),
}

#[derive(Debug)]
pub struct SessionState {
    pub context: SessionContext,
    pub round: u32,
}

/// Multi-turn session handle with FIFO round ordering.
///
/// A round acquires the session before building its payload and releases it
/// only after its response (or failure) has been folded back into the
/// context, so concurrent rounds of one session serialize in submission
/// order. The underlying tokio mutex hands the lock to waiters FIFO, which
/// is exactly the queue-of-waiters discipline this needs. This is the one
/// lock in the system held across an HTTP call.
pub struct UserSession {
    id: String,
    preferred_worker: usize,
    state: Arc<Mutex<SessionState>>,
}

impl UserSession {
    pub fn new(id: String, api_type: ApiType, preferred_worker: usize) -> Arc<Self> {
        let context = match api_type {
            ApiType::Completion => SessionContext::Text(String::new()),
            ApiType::Chat => SessionContext::Messages(Vec::new()),
        };
        Arc::new(Self {
            id,
            preferred_worker,
            state: Arc::new(Mutex::new(SessionState { context, round: 0 })),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Worker this session's rounds are routed to, keeping its context and
    /// any server-side prefix cache on one connection pool.
    pub fn preferred_worker(&self) -> Option<usize> {
        Some(self.preferred_worker)
    }

    /// Begin the next round: waits FIFO behind in-flight rounds, then hands
    /// back exclusive access to the context. The round counter is bumped on
    /// acquisition, matching submission order.
    pub async fn begin_round(&self) -> OwnedMutexGuard<SessionState> {
        let mut guard = Arc::clone(&self.state).lock_owned().await;
        guard.round += 1;
        guard
    }
}

/// Fold a completed completion-API round into the context.
pub fn update_text_context(state: &mut SessionState, prompt: &str, response: &str) {
    state.context = SessionContext::Text(format!("{prompt} {response}"));
}

/// Fold a completed chat round into the history:
/// `history <- history + user messages + assistant response`.
/// System messages are kept only on the first round.
pub fn update_chat_context(
    state: &mut SessionState,
    sent_messages: &[ChatMessage],
    response: &str,
) {
    let history = match &mut state.context {
        SessionContext::Messages(h) => h,
        SessionContext::Text(_) => return,
    };
    if history.is_empty() {
        history.extend(sent_messages.iter().cloned());
    } else {
        history.extend(
            sent_messages
                .iter()
                .filter(|m| m.role != "system")
                .cloned(),
        );
    }
    history.push(ChatMessage::assistant(response));
}
