use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{ApiType, DataConfig};
use crate::session::UserSession;
use crate::tokenizer::Tokenizer;

/// One turn of a chat conversation, wire-compatible with the OpenAI schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Request payload content, tagged by API flavor.
#[derive(Debug, Clone)]
pub enum Prompt {
    Completion { prompt: String },
    Chat { messages: Vec<ChatMessage> },
}

impl Prompt {
    pub fn api_type(&self) -> ApiType {
        match self {
            Prompt::Completion { .. } => ApiType::Completion,
            Prompt::Chat { .. } => ApiType::Chat,
        }
    }
}

/// A fully resolved request ready for the lifecycle engine.
#[derive(Clone)]
pub struct RequestDescriptor {
    pub prompt: Prompt,
    pub max_tokens: u32,
    pub ttft_slo_sec: Option<f64>,
    pub tpot_slo_sec: Option<f64>,
    /// Multi-turn session handle. Rounds of one session execute FIFO.
    pub session: Option<Arc<UserSession>>,
}

/// Descriptor handed to the scheduler. Lazy descriptors carry only an index
/// into the adapter's precomputed corpus so a large corpus is never
/// materialized in the dispatch path; the owning worker resolves them.
#[derive(Clone)]
pub enum Descriptor {
    Concrete(RequestDescriptor),
    Lazy {
        index: usize,
        preferred_worker: Option<usize>,
    },
}

impl Descriptor {
    pub fn preferred_worker(&self) -> Option<usize> {
        match self {
            Descriptor::Concrete(d) => d
                .session
                .as_ref()
                .and_then(|s| s.preferred_worker()),
            Descriptor::Lazy {
                preferred_worker, ..
            } => *preferred_worker,
        }
    }
}

/// Produces the request stream the scheduler consumes.
///
/// `next_descriptor` is an infinite lazy sequence for synthetic corpora;
/// `None` signals a finite corpus ran dry, which ends the run cleanly.
/// Implementations must be callable from any worker (`resolve` runs inside
/// the worker that received a lazy descriptor).
pub trait DataGenerator: Send + Sync {
    fn api_type(&self) -> ApiType;
    fn next_descriptor(&self) -> Option<Descriptor>;
    fn resolve(&self, index: usize) -> Option<RequestDescriptor>;
}

/// Canned prompt generator for smoke tests and the mock target.
pub struct MockDataGenerator {
    api_type: ApiType,
    max_tokens: u32,
    ttft_slo_sec: Option<f64>,
    tpot_slo_sec: Option<f64>,
    total_requests: Option<u64>,
    cursor: AtomicU64,
}

const MOCK_PROMPTS: &[&str] = &[
    "Explain the difference between concurrency and parallelism.",
    "Summarize the plot of a heist movie in three sentences.",
    "Write a haiku about garbage collection.",
    "List five uses for a spare network switch.",
];

impl MockDataGenerator {
    pub fn new(api_type: ApiType, config: &DataConfig) -> Self {
        Self {
            api_type,
            max_tokens: config.output_tokens,
            ttft_slo_sec: config.ttft_slo_sec,
            tpot_slo_sec: config.tpot_slo_sec,
            total_requests: config.total_requests,
            cursor: AtomicU64::new(0),
        }
    }

    fn descriptor_for(&self, i: u64) -> RequestDescriptor {
        let text = MOCK_PROMPTS[(i as usize) % MOCK_PROMPTS.len()];
        let prompt = match self.api_type {
            ApiType::Completion => Prompt::Completion {
                prompt: text.to_string(),
            },
            ApiType::Chat => Prompt::Chat {
                messages: vec![ChatMessage::user(text)],
            },
        };
        RequestDescriptor {
            prompt,
            max_tokens: self.max_tokens,
            ttft_slo_sec: self.ttft_slo_sec,
            tpot_slo_sec: self.tpot_slo_sec,
            session: None,
        }
    }
}

impl DataGenerator for MockDataGenerator {
    fn api_type(&self) -> ApiType {
        self.api_type
    }

    fn next_descriptor(&self) -> Option<Descriptor> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        if let Some(total) = self.total_requests {
            if i >= total {
                return None;
            }
        }
        Some(Descriptor::Concrete(self.descriptor_for(i)))
    }

    fn resolve(&self, index: usize) -> Option<RequestDescriptor> {
        Some(self.descriptor_for(index as u64))
    }
}

/// Shared-prefix synthetic corpus with exact token lengths.
///
/// The corpus is `num_groups * prompts_per_group` prompts; prompts within a
/// group share a common prefix of `shared_prefix_tokens` tokens, which is
/// what prefix-cache-aware servers optimize for. Prompt text is decoded from
/// uniformly drawn token ids so lengths are exact under the run tokenizer.
///
/// Emits lazy descriptors: the dispatch path moves only `(index, worker)`
/// pairs and the worker resolves the text. When `multi_turn` is on, each
/// group becomes a user session pinned to one worker.
pub struct SyntheticCorpusGenerator {
    api_type: ApiType,
    max_tokens: u32,
    ttft_slo_sec: Option<f64>,
    tpot_slo_sec: Option<f64>,
    total_requests: Option<u64>,
    prefixes: Vec<String>,
    suffixes: Vec<String>,
    prompts_per_group: usize,
    sessions: Option<Vec<Arc<UserSession>>>,
    cursor: AtomicU64,
}

impl SyntheticCorpusGenerator {
    pub fn new(
        api_type: ApiType,
        config: &DataConfig,
        tokenizer: &dyn Tokenizer,
        num_workers: usize,
        seed: Option<u64>,
    ) -> Result<Self> {
        if config.input_tokens == 0 {
            bail!("data.input_tokens must be > 0 for the synthetic corpus");
        }
        if config.shared_prefix_tokens >= config.input_tokens {
            bail!("data.shared_prefix_tokens must be smaller than data.input_tokens");
        }
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let suffix_len = (config.input_tokens - config.shared_prefix_tokens) as usize;
        let mut prefixes = Vec::with_capacity(config.num_groups);
        let mut suffixes = Vec::with_capacity(config.num_groups * config.prompts_per_group);
        for _ in 0..config.num_groups {
            prefixes.push(random_text(
                &mut rng,
                tokenizer,
                config.shared_prefix_tokens as usize,
            ));
            for _ in 0..config.prompts_per_group {
                suffixes.push(random_text(&mut rng, tokenizer, suffix_len));
            }
        }

        let sessions = if config.multi_turn {
            Some(
                (0..config.num_groups)
                    .map(|g| UserSession::new(format!("group-{g}"), api_type, g % num_workers))
                    .collect(),
            )
        } else {
            None
        };

        Ok(Self {
            api_type,
            max_tokens: config.output_tokens,
            ttft_slo_sec: config.ttft_slo_sec,
            tpot_slo_sec: config.tpot_slo_sec,
            total_requests: config.total_requests,
            prefixes,
            suffixes,
            prompts_per_group: config.prompts_per_group,
            sessions,
            cursor: AtomicU64::new(0),
        })
    }

    fn corpus_len(&self) -> usize {
        self.suffixes.len()
    }

    fn group_of(&self, index: usize) -> usize {
        index / self.prompts_per_group
    }
}

fn random_text(rng: &mut StdRng, tokenizer: &dyn Tokenizer, tokens: usize) -> String {
    // Stay below the special-token range so decode is always well-formed.
    let vocab = tokenizer.vocab_size().min(50_000) as u32;
    let ids: Vec<u32> = (0..tokens).map(|_| rng.gen_range(0..vocab)).collect();
    tokenizer.decode(&ids)
}

impl DataGenerator for SyntheticCorpusGenerator {
    fn api_type(&self) -> ApiType {
        self.api_type
    }

    fn next_descriptor(&self) -> Option<Descriptor> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        if let Some(total) = self.total_requests {
            if i >= total {
                return None;
            }
        }
        let index = (i as usize) % self.corpus_len();
        let preferred_worker = self
            .sessions
            .as_ref()
            .map(|s| s[self.group_of(index)].preferred_worker())
            .unwrap_or(None);
        Some(Descriptor::Lazy {
            index,
            preferred_worker,
        })
    }

    fn resolve(&self, index: usize) -> Option<RequestDescriptor> {
        if index >= self.corpus_len() {
            return None;
        }
        let group = self.group_of(index);
        let text = format!("{} {}", self.prefixes[group], self.suffixes[index]);
        let prompt = match self.api_type {
            ApiType::Completion => Prompt::Completion { prompt: text },
            ApiType::Chat => Prompt::Chat {
                messages: vec![ChatMessage::user(text)],
            },
        };
        Some(RequestDescriptor {
            prompt,
            max_tokens: self.max_tokens,
            ttft_slo_sec: self.ttft_slo_sec,
            tpot_slo_sec: self.tpot_slo_sec,
            session: self.sessions.as_ref().map(|s| Arc::clone(&s[group])),
        })
    }
}

/// Read a trace file's timestamp column: one float per line, or the first
/// comma-separated column. Lines that do not parse (headers, blanks) are
/// skipped.
pub fn load_trace_timestamps(path: &Path) -> Result<Vec<f64>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read trace file {}", path.display()))?;
    let mut out = Vec::new();
    for line in raw.lines() {
        let field = line.split(',').next().unwrap_or("").trim();
        if let Ok(ts) = field.parse::<f64>() {
            out.push(ts);
        }
    }
    if out.is_empty() {
        bail!("trace file {} has no parseable timestamps", path.display());
    }
    out.sort_by(|a, b| a.partial_cmp(b).unwrap());
    Ok(out)
}
