//! Streamed (SSE) request lifecycle against the mock server.

mod common;

use common::{assert_time_invariants, base_config, rate_stage, run_bench};
use infbench::mock::{spawn, MockServerConfig};
use infbench::sink::Outcome;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn streaming_stamps_token_timings_and_counts() {
    let base = spawn(MockServerConfig {
        ttft_ms: 20,
        itl_ms: 5,
        tokens: 10,
        fail_rate: 0.0,
    })
    .await
    .unwrap();

    let mut config = base_config(&base, vec![rate_stage(10.0, 1.0)]);
    config.api.streaming = true;
    config.data.output_tokens = 32;

    let outcome = run_bench(&config, CancellationToken::new()).await;
    let records = outcome.sink.drain_by_stage().remove(&0).unwrap();
    assert_time_invariants(&records);

    let successes: Vec<_> = records
        .iter()
        .filter(|r| r.outcome == Outcome::Success)
        .collect();
    assert!(!successes.is_empty());

    for r in &successes {
        // Server reports usage on the final chunk; the engine trusts it.
        assert_eq!(r.output_tokens, Some(10), "usage should win over counting");
        let first = r.first_token_time.expect("streamed request lost TTFT");
        let last = r.last_token_time.expect("streamed request lost last token");
        assert!(first < r.completion_time);
        assert!(first <= last);
        assert!(
            r.normalized_time_per_output_token().unwrap() > 0.0,
            "per-token latency must be positive"
        );
        // 9 inter-token gaps of ~5ms each.
        let itl = r.inter_token_latency().unwrap();
        assert!(itl > 0.0 && itl < 0.1, "itl {itl} out of band");
        // TTFT reflects the server's first-token delay, not full generation.
        let ttft = r.ttft().unwrap();
        assert!(ttft < r.request_latency());
    }
}

#[tokio::test]
async fn chat_streaming_works_end_to_end() {
    let base = spawn(MockServerConfig {
        ttft_ms: 5,
        itl_ms: 2,
        tokens: 6,
        fail_rate: 0.0,
    })
    .await
    .unwrap();

    let mut config = base_config(&base, vec![rate_stage(10.0, 1.0)]);
    config.api.api_type = infbench::config::ApiType::Chat;
    config.api.streaming = true;

    let outcome = run_bench(&config, CancellationToken::new()).await;
    let records = outcome.sink.drain_by_stage().remove(&0).unwrap();

    let successes = records
        .iter()
        .filter(|r| r.outcome == Outcome::Success)
        .count();
    assert!(successes > 0, "no successful chat streams");
    for r in records.iter().filter(|r| r.outcome == Outcome::Success) {
        assert_eq!(r.output_tokens, Some(6));
        assert!(r.first_token_time.is_some());
    }
}
