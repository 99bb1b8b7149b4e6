use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::catalog::MetricCatalog;
use crate::config::PrometheusConfig;
use crate::scheduler::StageRuntimeInfo;

/// Extra settling time on top of the scrape interval so the last data points
/// of a stage are on the server before we query.
const SCRAPE_BUFFER_SEC: f64 = 2.0;

/// GCE metadata endpoint providing the ambient service-account token.
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh tokens this long before they expire.
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// Keyed scalar results for one collection window. Failed queries are
/// explicit `None`s, never missing keys.
pub type ScrapeResult = BTreeMap<String, Option<f64>>;

/// Server-side metrics collection contract the report pipeline consumes.
///
/// Failures surface as `None` values (or a `None` dump), never as errors: a
/// missing metrics backend must not fail a benchmark run.
#[async_trait]
pub trait MetricsClient: Send + Sync {
    /// Wait for the backend to have scraped the last data points.
    async fn wait_for_scrape(&self);

    /// Evaluate the catalog over one stage's window.
    async fn collect_stage(&self, stage: &StageRuntimeInfo) -> ScrapeResult;

    /// Evaluate the catalog over the full run window.
    async fn collect_summary(&self, start_unix: f64, end_unix: f64) -> ScrapeResult;

    /// Dump the tracked metrics in Prometheus exposition format.
    async fn collect_raw(&self, range: Option<(f64, f64, u64)>) -> Option<String>;
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Prometheus scrape-and-aggregate client.
///
/// Two targets share one code path: a self-hosted server queried over plain
/// HTTP, and a managed variant that signs every request with the ambient
/// credential and cannot use `/federate`. Both implement the same
/// `(query, eval_time) -> Option<f64>` contract; a failed query yields
/// `None` for that key and never fails the run.
pub struct PrometheusScraper {
    http: reqwest::Client,
    base_url: String,
    scrape_interval: u64,
    google_managed: bool,
    catalog: MetricCatalog,
    filters: Vec<String>,
    token: Mutex<Option<CachedToken>>,
}

impl PrometheusScraper {
    pub fn new(config: &PrometheusConfig, catalog: MetricCatalog) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build Prometheus HTTP client")?;
        let mut filters = Vec::new();
        if let Some(first) = catalog.values().next() {
            filters = first.filters.clone();
        }
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            scrape_interval: config.scrape_interval,
            google_managed: config.google_managed,
            catalog,
            filters,
            token: Mutex::new(None),
        })
    }

    async fn collect_window(&self, duration: f64, eval_time: f64) -> ScrapeResult {
        let mut out = ScrapeResult::new();
        for (key, metric) in &self.catalog {
            let value = match metric.query(duration) {
                Some(query) => self.execute_query(&query, eval_time).await,
                None => None,
            };
            out.insert(key.clone(), value);
        }
        out
    }

    /// Execute one instant query. `None` on any failure.
    pub async fn execute_query(&self, query: &str, eval_time: f64) -> Option<f64> {
        let url = format!("{}/api/v1/query", self.base_url);
        tracing::debug!(query, eval_time, "PromQL instant query");

        let time = eval_time.to_string();
        let mut req = self
            .http
            .get(&url)
            .query(&[("query", query), ("time", time.as_str())]);
        req = self.authorize(req).await;

        let resp = match req.send().await {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(query, error = %err, "PromQL query failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            tracing::warn!(query, status = %resp.status(), "PromQL query rejected");
            return None;
        }
        let body: PromResponse = match resp.json().await {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!(query, error = %err, "PromQL response unparseable");
                return None;
            }
        };
        if body.status != "success" {
            tracing::warn!(query, status = %body.status, "PromQL query errored");
            return None;
        }

        let value = body
            .data
            .result
            .first()
            .and_then(|r| r.value.as_ref())
            .and_then(|(_, v)| v.parse::<f64>().ok())?;
        // Keep report artifacts readable.
        Some((value * 1e6).round() / 1e6)
    }

    async fn federate(&self, match_param: &str) -> Option<String> {
        let url = format!("{}/federate", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("match[]", match_param)])
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let text = resp.text().await.ok()?;
        let groups = group_exposition(&text);
        if groups.is_empty() {
            return None;
        }
        Some(render_groups(&groups))
    }
}

#[async_trait]
impl MetricsClient for PrometheusScraper {
    async fn wait_for_scrape(&self) {
        let wait = self.scrape_interval as f64 + SCRAPE_BUFFER_SEC;
        tracing::debug!(seconds = wait, "waiting for Prometheus scrape");
        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
    }

    /// The query is evaluated at `end + scrape_interval + buffer` so the
    /// window includes the stage's final scrape.
    async fn collect_stage(&self, stage: &StageRuntimeInfo) -> ScrapeResult {
        let eval_time = stage.end_unix + self.scrape_interval as f64 + SCRAPE_BUFFER_SEC;
        let duration = eval_time - stage.start_unix;
        self.collect_window(duration, eval_time).await
    }

    async fn collect_summary(&self, start_unix: f64, end_unix: f64) -> ScrapeResult {
        let eval_time = end_unix + self.scrape_interval as f64 + SCRAPE_BUFFER_SEC;
        let duration = eval_time - start_unix;
        self.collect_window(duration, eval_time).await
    }

    /// Instant dumps prefer `/federate`; range dumps and the managed target
    /// synthesize exposition text from query results.
    async fn collect_raw(&self, range: Option<(f64, f64, u64)>) -> Option<String> {
        let match_param = format!("{{{}}}", self.filters.join(","));

        if range.is_none() && !self.google_managed {
            if let Some(text) = self.federate(&match_param).await {
                return Some(text);
            }
            tracing::debug!("federate query failed, falling back to query endpoint");
        }

        // The managed target rejects bare vector selectors, so also try each
        // tracked metric name with the filter set.
        let mut queries = vec![match_param.clone()];
        if self.google_managed {
            let mut names: Vec<&str> = self
                .catalog
                .values()
                .map(|m| m.name.as_str())
                .collect();
            names.sort_unstable();
            names.dedup();
            queries.extend(names.into_iter().map(|n| format!("{n}{match_param}")));
        }

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for query in queries {
            self.raw_query_into(&query, range, &mut groups).await;
        }
        if groups.is_empty() {
            return None;
        }
        Some(render_groups(&groups))
    }
}

impl PrometheusScraper {
    async fn raw_query_into(
        &self,
        query: &str,
        range: Option<(f64, f64, u64)>,
        groups: &mut BTreeMap<String, Vec<String>>,
    ) {
        let (url, params): (String, Vec<(String, String)>) = match range {
            Some((start, end, step)) => (
                format!("{}/api/v1/query_range", self.base_url),
                vec![
                    ("query".into(), query.to_string()),
                    ("start".into(), start.to_string()),
                    ("end".into(), end.to_string()),
                    ("step".into(), format!("{step}s")),
                ],
            ),
            None => (
                format!("{}/api/v1/query", self.base_url),
                vec![("query".into(), query.to_string())],
            ),
        };

        let mut req = self.http.get(&url).query(&params);
        req = self.authorize(req).await;
        let Ok(resp) = req.send().await else { return };
        if !resp.status().is_success() {
            return;
        }
        let Ok(body) = resp.json::<PromResponse>().await else {
            return;
        };
        if body.status != "success" {
            return;
        }

        for result in body.data.result {
            let Some(name) = result.metric.get("__name__") else {
                continue;
            };
            let labels: Vec<String> = result
                .metric
                .iter()
                .filter(|(k, _)| *k != "__name__")
                .map(|(k, v)| format!("{k}=\"{v}\""))
                .collect();
            let label_str = if labels.is_empty() {
                String::new()
            } else {
                format!("{{{}}}", labels.join(","))
            };
            let lines = groups.entry(name.clone()).or_default();
            if result.values.is_empty() {
                if let Some((_, v)) = &result.value {
                    lines.push(format!("{name}{label_str} {v}"));
                }
            } else {
                for (ts, v) in &result.values {
                    let ts_ms = (ts * 1000.0) as i64;
                    lines.push(format!("{name}{label_str} {v} {ts_ms}"));
                }
            }
        }
    }

    async fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if !self.google_managed {
            return req;
        }
        match self.ambient_token().await {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Fetch (and cache) the service-account token from the metadata server.
    async fn ambient_token(&self) -> Option<String> {
        let mut cached = self.token.lock().await;
        if let Some(t) = cached.as_ref() {
            if t.expires_at > Instant::now() {
                return Some(t.token.clone());
            }
        }

        let resp = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await;
        let body: MetadataToken = match resp {
            Ok(r) if r.status().is_success() => match r.json().await {
                Ok(b) => b,
                Err(err) => {
                    tracing::warn!(error = %err, "metadata token response unparseable");
                    return None;
                }
            },
            Ok(r) => {
                tracing::warn!(status = %r.status(), "metadata token request rejected");
                return None;
            }
            Err(err) => {
                tracing::warn!(error = %err, "metadata token request failed");
                return None;
            }
        };

        let expires_at = Instant::now()
            + Duration::from_secs(body.expires_in)
                .saturating_sub(TOKEN_EXPIRY_SLACK);
        let token = body.access_token.clone();
        *cached = Some(CachedToken {
            token: body.access_token,
            expires_at,
        });
        Some(token)
    }
}

/// Group raw exposition text by metric name, keeping `# HELP` / `# TYPE`
/// lines with their family.
fn group_exposition(text: &str) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let name = if line.starts_with('#') {
            let mut parts = line.split(' ');
            // "# TYPE <name> <kind>"
            match parts.nth(2) {
                Some(n) => n.to_string(),
                None => continue,
            }
        } else {
            line.split(['{', ' ']).next().unwrap_or("").to_string()
        };
        if name.is_empty() {
            continue;
        }
        groups.entry(name).or_default().push(line.to_string());
    }
    groups
}

fn render_groups(groups: &BTreeMap<String, Vec<String>>) -> String {
    let mut out = String::new();
    for lines in groups.values() {
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: PromData,
}

#[derive(Debug, Default, Deserialize)]
struct PromData {
    #[serde(default)]
    result: Vec<PromResult>,
}

#[derive(Debug, Deserialize)]
struct PromResult {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    value: Option<(f64, String)>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::catalog_for;
    use crate::config::ServerType;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn prom_config(url: &str) -> PrometheusConfig {
        PrometheusConfig {
            url: url.to_string(),
            scrape_interval: 15,
            google_managed: false,
            filters: vec![],
        }
    }

    fn scraper(url: &str) -> PrometheusScraper {
        let catalog = catalog_for(ServerType::Vllm, "llama", &[]);
        PrometheusScraper::new(&prom_config(url), catalog).unwrap()
    }

    fn success_body(value: &str) -> serde_json::Value {
        serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {}, "value": [1632741820.781, value]}
                ]
            }
        })
    }

    #[tokio::test]
    async fn execute_query_parses_scalar() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body("0.125")))
            .mount(&server)
            .await;

        let s = scraper(&server.uri());
        let v = s.execute_query("up", 1632741820.0).await;
        assert_eq!(v, Some(0.125));
    }

    #[tokio::test]
    async fn execute_query_rounds_to_six_decimals() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(success_body("0.12345678901")),
            )
            .mount(&server)
            .await;

        let s = scraper(&server.uri());
        assert_eq!(s.execute_query("up", 0.0).await, Some(0.123457));
    }

    #[tokio::test]
    async fn failed_query_yields_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let s = scraper(&server.uri());
        assert_eq!(s.execute_query("up", 0.0).await, None);
    }

    #[tokio::test]
    async fn empty_result_yields_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {"resultType": "vector", "result": []}
            })))
            .mount(&server)
            .await;

        let s = scraper(&server.uri());
        assert_eq!(s.execute_query("up", 0.0).await, None);
    }

    #[tokio::test]
    async fn collect_stage_returns_every_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body("1.0")))
            .mount(&server)
            .await;

        let s = scraper(&server.uri());
        let stage = StageRuntimeInfo {
            stage_id: 0,
            requested_rate: Some(10.0),
            start_time: 0.0,
            end_time: 30.0,
            start_unix: 1000.0,
            end_unix: 1030.0,
        };
        let result = s.collect_stage(&stage).await;
        assert_eq!(result.len(), s.catalog.len());
        assert!(result.values().all(|v| v.is_some()));
    }

    #[tokio::test]
    async fn federate_groups_by_metric_name() {
        let server = MockServer::start().await;
        let exposition = "# TYPE vllm:prompt_tokens counter\n\
             vllm:prompt_tokens{model_name=\"llama\"} 100\n\
             vllm:generation_tokens{model_name=\"llama\"} 50\n";
        Mock::given(method("GET"))
            .and(path("/federate"))
            .and(query_param("match[]", "{model_name='llama'}"))
            .respond_with(ResponseTemplate::new(200).set_body_string(exposition))
            .mount(&server)
            .await;

        let s = scraper(&server.uri());
        let raw = s.collect_raw(None).await.unwrap();
        assert!(raw.contains("# TYPE vllm:prompt_tokens counter"));
        assert!(raw.contains("vllm:generation_tokens{model_name=\"llama\"} 50"));
    }

    #[tokio::test]
    async fn raw_falls_back_to_instant_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/federate"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {"resultType": "vector", "result": [
                    {"metric": {"__name__": "vllm:prompt_tokens", "model_name": "llama"},
                     "value": [1000.0, "123"]}
                ]}
            })))
            .mount(&server)
            .await;

        let s = scraper(&server.uri());
        let raw = s.collect_raw(None).await.unwrap();
        assert_eq!(raw, "vllm:prompt_tokens{model_name=\"llama\"} 123\n");
    }

    #[test]
    fn group_exposition_handles_help_and_type_lines() {
        let text = "# HELP m1 a metric\n# TYPE m1 gauge\nm1{a=\"b\"} 1\nm2 2\n";
        let groups = group_exposition(text);
        assert_eq!(groups["m1"].len(), 3);
        assert_eq!(groups["m2"], vec!["m2 2".to_string()]);
    }
}
