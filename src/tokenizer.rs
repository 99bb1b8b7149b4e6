use anyhow::{Context, Result};
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Narrow tokenizer contract used by the lifecycle engine and the synthetic
/// corpus. Pure after construction; implementations must not do I/O per call.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> u32;
    fn decode(&self, ids: &[u32]) -> String;
    fn vocab_size(&self) -> usize;
}

/// BPE tokenizer backed by the cl100k vocabulary.
///
/// Used to count streamed deltas when the server does not report usage, and
/// to synthesize prompts with exact token lengths. It is an approximation for
/// non-OpenAI vocabularies, which is acceptable: server-reported usage always
/// wins when present.
pub struct BpeTokenizer {
    bpe: CoreBPE,
}

impl BpeTokenizer {
    pub fn new() -> Result<Self> {
        let bpe = cl100k_base().context("failed to load cl100k tokenizer")?;
        Ok(Self { bpe })
    }
}

impl Tokenizer for BpeTokenizer {
    fn count_tokens(&self, text: &str) -> u32 {
        self.bpe.encode_with_special_tokens(text).len() as u32
    }

    fn decode(&self, ids: &[u32]) -> String {
        self.bpe.decode(ids.to_vec()).unwrap_or_default()
    }

    fn vocab_size(&self) -> usize {
        // cl100k ranks are dense up to the special-token range.
        100_256
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_stable_and_nonzero() {
        let tok = BpeTokenizer::new().unwrap();
        let n = tok.count_tokens("the quick brown fox jumps over the lazy dog");
        assert!(n >= 5 && n <= 15, "unexpected token count {n}");
        assert_eq!(n, tok.count_tokens("the quick brown fox jumps over the lazy dog"));
    }

    #[test]
    fn empty_string_is_zero_tokens() {
        let tok = BpeTokenizer::new().unwrap();
        assert_eq!(tok.count_tokens(""), 0);
    }

    #[test]
    fn decode_produces_text() {
        let tok = BpeTokenizer::new().unwrap();
        let text = tok.decode(&[464, 2068, 7586]);
        assert!(!text.is_empty());
        // Re-encoding decoded text may merge differently, but stays close.
        let n = tok.count_tokens(&text);
        assert!((1..=6).contains(&n), "unexpected recount {n}");
    }
}
