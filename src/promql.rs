use serde::{Deserialize, Serialize};

/// Prometheus metric family type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Gauge,
    Counter,
    Histogram,
}

/// Aggregation evaluated over the stage window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOp {
    Mean,
    Median,
    Min,
    Max,
    P90,
    P99,
    Rate,
    Increase,
    Sd,
}

/// One server-side metric to summarize: source metric name, family type,
/// aggregation, and label filters. `query()` renders the PromQL for a given
/// window; the strings are stable byte-for-byte for a `(metric, duration)`
/// pair, which downstream golden tests rely on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromMetric {
    pub name: String,
    pub kind: MetricKind,
    pub op: QueryOp,
    pub filters: Vec<String>,
}

impl PromMetric {
    pub fn new(
        name: impl Into<String>,
        kind: MetricKind,
        op: QueryOp,
        filters: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            op,
            filters,
        }
    }

    fn filter_str(&self) -> String {
        self.filters.join(",")
    }

    /// Render the PromQL query over a trailing window of `duration` seconds,
    /// or `None` when the aggregation does not apply to the family type
    /// (e.g. `rate` of a gauge).
    pub fn query(&self, duration: f64) -> Option<String> {
        let m = &self.name;
        let f = self.filter_str();
        let d = format!("{duration:.0}");

        let q = match self.kind {
            MetricKind::Gauge => match self.op {
                QueryOp::Mean => format!("avg_over_time({m}{{{f}}}[{d}s])"),
                QueryOp::Median => format!("quantile_over_time(0.5, {m}{{{f}}}[{d}s])"),
                QueryOp::Sd => format!("stddev_over_time({m}{{{f}}}[{d}s])"),
                QueryOp::Min => format!("min_over_time({m}{{{f}}}[{d}s])"),
                QueryOp::Max => format!("max_over_time({m}{{{f}}}[{d}s])"),
                QueryOp::P90 => format!("quantile_over_time(0.9, {m}{{{f}}}[{d}s])"),
                QueryOp::P99 => format!("quantile_over_time(0.99, {m}{{{f}}}[{d}s])"),
                QueryOp::Rate | QueryOp::Increase => return None,
            },
            MetricKind::Counter => match self.op {
                QueryOp::Rate => format!("sum(rate({m}{{{f}}}[{d}s]))"),
                QueryOp::Increase => format!("sum(increase({m}{{{f}}}[{d}s]))"),
                QueryOp::Mean => {
                    format!("avg_over_time(rate({m}{{{f}}}[{d}s])[{d}s:{d}s])")
                }
                QueryOp::Max => {
                    format!("max_over_time(rate({m}{{{f}}}[{d}s])[{d}s:{d}s])")
                }
                QueryOp::Min => {
                    format!("min_over_time(rate({m}{{{f}}}[{d}s])[{d}s:{d}s])")
                }
                QueryOp::P90 => {
                    format!("quantile_over_time(0.9, rate({m}{{{f}}}[{d}s])[{d}s:{d}s])")
                }
                QueryOp::P99 => {
                    format!("quantile_over_time(0.99, rate({m}{{{f}}}[{d}s])[{d}s:{d}s])")
                }
                QueryOp::Median | QueryOp::Sd => return None,
            },
            MetricKind::Histogram => match self.op {
                QueryOp::Mean => format!(
                    "sum(rate({m}_sum{{{f}}}[{d}s])) / (sum(rate({m}_count{{{f}}}[{d}s])) > 0)"
                ),
                QueryOp::Increase => format!("sum(increase({m}_count{{{f}}}[{d}s]))"),
                QueryOp::Rate => format!("sum(rate({m}_count{{{f}}}[{d}s]))"),
                QueryOp::Median => Self::histogram_quantile("0.5", m, &f, &d),
                QueryOp::Min => Self::histogram_quantile("0", m, &f, &d),
                QueryOp::Max => Self::histogram_quantile("1", m, &f, &d),
                QueryOp::P90 => Self::histogram_quantile("0.9", m, &f, &d),
                QueryOp::P99 => Self::histogram_quantile("0.99", m, &f, &d),
                QueryOp::Sd => return None,
            },
        };
        Some(q)
    }

    fn histogram_quantile(q: &str, m: &str, f: &str, d: &str) -> String {
        format!("histogram_quantile({q}, sum(rate({m}_bucket{{{f}}}[{d}s])) by (le))")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(kind: MetricKind, op: QueryOp) -> PromMetric {
        PromMetric::new(
            "vllm:time_to_first_token_seconds",
            kind,
            op,
            vec!["model_name='llama'".to_string()],
        )
    }

    #[test]
    fn gauge_queries_golden() {
        let cases = [
            (
                QueryOp::Mean,
                "avg_over_time(vllm:time_to_first_token_seconds{model_name='llama'}[63s])",
            ),
            (
                QueryOp::Median,
                "quantile_over_time(0.5, vllm:time_to_first_token_seconds{model_name='llama'}[63s])",
            ),
            (
                QueryOp::Sd,
                "stddev_over_time(vllm:time_to_first_token_seconds{model_name='llama'}[63s])",
            ),
            (
                QueryOp::Min,
                "min_over_time(vllm:time_to_first_token_seconds{model_name='llama'}[63s])",
            ),
            (
                QueryOp::Max,
                "max_over_time(vllm:time_to_first_token_seconds{model_name='llama'}[63s])",
            ),
            (
                QueryOp::P90,
                "quantile_over_time(0.9, vllm:time_to_first_token_seconds{model_name='llama'}[63s])",
            ),
            (
                QueryOp::P99,
                "quantile_over_time(0.99, vllm:time_to_first_token_seconds{model_name='llama'}[63s])",
            ),
        ];
        for (op, expected) in cases {
            assert_eq!(
                metric(MetricKind::Gauge, op).query(62.7).as_deref(),
                Some(expected)
            );
        }
    }

    #[test]
    fn counter_queries_golden() {
        let m = PromMetric::new(
            "vllm:request_success",
            MetricKind::Counter,
            QueryOp::Rate,
            vec!["model_name='llama'".to_string()],
        );
        assert_eq!(
            m.query(120.0).as_deref(),
            Some("sum(rate(vllm:request_success{model_name='llama'}[120s]))")
        );

        let increase = PromMetric {
            op: QueryOp::Increase,
            ..m.clone()
        };
        assert_eq!(
            increase.query(120.0).as_deref(),
            Some("sum(increase(vllm:request_success{model_name='llama'}[120s]))")
        );

        let mean = PromMetric {
            op: QueryOp::Mean,
            ..m.clone()
        };
        assert_eq!(
            mean.query(120.0).as_deref(),
            Some("avg_over_time(rate(vllm:request_success{model_name='llama'}[120s])[120s:120s])")
        );

        let p99 = PromMetric { op: QueryOp::P99, ..m };
        assert_eq!(
            p99.query(120.0).as_deref(),
            Some(
                "quantile_over_time(0.99, rate(vllm:request_success{model_name='llama'}[120s])[120s:120s])"
            )
        );
    }

    #[test]
    fn histogram_queries_golden() {
        let m = metric(MetricKind::Histogram, QueryOp::Mean);
        assert_eq!(
            m.query(90.0).as_deref(),
            Some(
                "sum(rate(vllm:time_to_first_token_seconds_sum{model_name='llama'}[90s])) / (sum(rate(vllm:time_to_first_token_seconds_count{model_name='llama'}[90s])) > 0)"
            )
        );

        let m = metric(MetricKind::Histogram, QueryOp::P90);
        assert_eq!(
            m.query(90.0).as_deref(),
            Some(
                "histogram_quantile(0.9, sum(rate(vllm:time_to_first_token_seconds_bucket{model_name='llama'}[90s])) by (le))"
            )
        );

        let m = metric(MetricKind::Histogram, QueryOp::Min);
        assert_eq!(
            m.query(90.0).as_deref(),
            Some(
                "histogram_quantile(0, sum(rate(vllm:time_to_first_token_seconds_bucket{model_name='llama'}[90s])) by (le))"
            )
        );
    }

    #[test]
    fn unsupported_combinations_yield_none() {
        assert!(metric(MetricKind::Gauge, QueryOp::Rate).query(10.0).is_none());
        assert!(metric(MetricKind::Gauge, QueryOp::Increase).query(10.0).is_none());
        assert!(metric(MetricKind::Histogram, QueryOp::Sd).query(10.0).is_none());
        let m = PromMetric::new("c", MetricKind::Counter, QueryOp::Median, vec![]);
        assert!(m.query(10.0).is_none());
    }

    #[test]
    fn multiple_filters_join_with_comma() {
        let m = PromMetric::new(
            "vllm:num_requests_waiting",
            MetricKind::Gauge,
            QueryOp::Mean,
            vec![
                "model_name='llama'".to_string(),
                "namespace='inference'".to_string(),
            ],
        );
        assert_eq!(
            m.query(30.0).as_deref(),
            Some(
                "avg_over_time(vllm:num_requests_waiting{model_name='llama',namespace='inference'}[30s])"
            )
        );
    }

    #[test]
    fn duration_is_rounded_to_whole_seconds() {
        let m = metric(MetricKind::Gauge, QueryOp::Mean);
        assert_eq!(
            m.query(45.4).as_deref(),
            Some("avg_over_time(vllm:time_to_first_token_seconds{model_name='llama'}[45s])")
        );
    }

    #[test]
    fn query_strings_are_stable() {
        let m = metric(MetricKind::Histogram, QueryOp::P99);
        assert_eq!(m.query(62.7), m.query(62.7));
    }
}
