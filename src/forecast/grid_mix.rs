use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

/// Grid-pollution signal: share of current grid generation from fossil sources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GridMixSource: Send + Sync {
    async fn fossil_pct(&self) -> Result<Option<f64>>;
}

/// Fixed value, for simulation and for sites without a mix feed.
#[derive(Debug, Clone, Default)]
pub struct StaticGridMix(pub Option<f64>);

#[async_trait]
impl GridMixSource for StaticGridMix {
    async fn fossil_pct(&self) -> Result<Option<f64>> {
        Ok(self.0)
    }
}

#[derive(Debug, Deserialize)]
struct RawMix {
    fossil_pct: Option<f64>,
}

/// Polls a JSON endpoint returning `{"fossil_pct": <number>}` and caches the answer.
#[derive(Clone)]
pub struct HttpGridMixSource {
    url: String,
    client: reqwest::Client,
    cache: Arc<RwLock<Option<(Instant, Option<f64>)>>>,
    ttl: Duration,
}

impl HttpGridMixSource {
    pub fn new(url: String, ttl: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("peak-export-controller/", env!("CARGO_PKG_VERSION"))),
        );
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            url,
            client,
            cache: Arc::new(RwLock::new(None)),
            ttl,
        })
    }
}

#[async_trait]
impl GridMixSource for HttpGridMixSource {
    async fn fossil_pct(&self) -> Result<Option<f64>> {
        {
            let cache = self.cache.read().await;
            if let Some((fetched_at, value)) = &*cache {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(*value);
                }
            }
        }

        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("grid mix GET failed")?;
        let status = resp.status();
        let body = resp.text().await.context("grid mix read failed")?;
        if !status.is_success() {
            anyhow::bail!("grid mix API error: HTTP {status}: {body}");
        }
        let raw: RawMix = serde_json::from_str(&body).context("grid mix JSON parse failed")?;
        let value = raw.fossil_pct.filter(|v| v.is_finite()).map(|v| v.clamp(0.0, 100.0));

        *self.cache.write().await = Some((Instant::now(), value));
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_source_parses_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mix"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"fossil_pct": 62.5})))
            .expect(1)
            .mount(&server)
            .await;

        let source =
            HttpGridMixSource::new(format!("{}/mix", server.uri()), Duration::from_secs(300)).unwrap();
        assert_eq!(source.fossil_pct().await.unwrap(), Some(62.5));
        // Second call is served from cache; the mock expects exactly one hit.
        assert_eq!(source.fossil_pct().await.unwrap(), Some(62.5));
    }

    #[tokio::test]
    async fn test_http_source_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let source = HttpGridMixSource::new(server.uri(), Duration::from_secs(300)).unwrap();
        assert!(source.fossil_pct().await.is_err());
    }

    #[tokio::test]
    async fn test_static_mix() {
        assert_eq!(StaticGridMix(Some(10.0)).fossil_pct().await.unwrap(), Some(10.0));
        assert_eq!(StaticGridMix(None).fossil_pct().await.unwrap(), None);
    }
}
