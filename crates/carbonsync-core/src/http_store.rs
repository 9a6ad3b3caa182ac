//! carbonserver query client.
//!
//! `GET {base}/render/?format=json&target=..&from=..&until=..` and
//! `GET {base}/info/?format=json&target=..`. A 404 is `Error::NotFound`.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::StoreConfig;
use crate::error::{Error, Result, TransportError};
use crate::model::{AggregationMethod, FetchedSeries, MetricInfo, RetentionTier};
use crate::store::MetricStore;

/// HTTP client for one carbonserver instance.
#[derive(Debug, Clone)]
pub struct CarbonserverClient {
    http: reqwest::Client,
    base: Url,
}

impl CarbonserverClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url).map_err(|e| TransportError::InvalidUrl {
            url: base_url.to_string(),
            message: e.to_string(),
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TransportError::Http)?;

        Ok(Self { http, base })
    }

    pub fn from_config(cfg: &StoreConfig) -> Result<Self> {
        Self::new(&cfg.url, cfg.timeout())
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self.base.join(path).map_err(|e| TransportError::InvalidUrl {
            url: format!("{}{path}", self.base),
            message: e.to_string(),
        })?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("format", "json");
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    /// GET `url` and return the body. 404 becomes `NotFound` for `metric`.
    async fn get_body(&self, url: Url, metric: &str) -> Result<String> {
        let start = Instant::now();
        let endpoint = url.path().to_string();

        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(TransportError::Http)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(metric));
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                endpoint,
                status: status.as_u16(),
            }
            .into());
        }

        let body = response.text().await.map_err(TransportError::Http)?;
        debug!(
            endpoint = %endpoint,
            metric,
            elapsed_ms = start.elapsed().as_millis() as u64,
            bytes = body.len(),
            "Store request complete"
        );
        Ok(body)
    }
}

impl MetricStore for CarbonserverClient {
    async fn fetch_series(&self, name: &str, from: u32, until: u32) -> Result<FetchedSeries> {
        let url = self.endpoint(
            "render/",
            &[
                ("target", name.to_string()),
                ("from", from.to_string()),
                ("until", until.to_string()),
            ],
        )?;
        let endpoint = url.path().to_string();
        let body = self.get_body(url, name).await?;
        decode_render(&endpoint, &body)
    }

    async fn get_info(&self, name: &str) -> Result<MetricInfo> {
        let url = self.endpoint("info/", &[("target", name.to_string())])?;
        let endpoint = url.path().to_string();
        let body = self.get_body(url, name).await?;
        decode_info(&endpoint, &body)
    }
}

// --- JSON response structures ---

#[derive(Deserialize)]
struct RenderResponse {
    metrics: Vec<RenderMetric>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenderMetric {
    name: String,
    start_time: u32,
    stop_time: u32,
    step_time: u32,
    values: Vec<Option<f64>>,
    #[serde(default)]
    is_absent: Option<Vec<bool>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InfoResponse {
    name: String,
    aggregation_method: String,
    // Zero-valued fields are omitted by carbonserver.
    #[serde(default)]
    max_retention: u32,
    #[serde(default)]
    x_files_factor: f32,
    #[serde(default)]
    retentions: Vec<InfoRetention>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InfoRetention {
    #[serde(default)]
    seconds_per_point: u32,
    #[serde(default)]
    number_of_points: u32,
}

fn invalid(endpoint: &str, message: impl Into<String>) -> Error {
    TransportError::InvalidResponse {
        endpoint: endpoint.to_string(),
        message: message.into(),
    }
    .into()
}

/// Decode a render body holding exactly one series. A `null` value is an
/// absent slot whether or not `isAbsent` is sent.
pub fn decode_render(endpoint: &str, body: &str) -> Result<FetchedSeries> {
    let response: RenderResponse =
        serde_json::from_str(body).map_err(|e| invalid(endpoint, e.to_string()))?;
    let mut metrics = response.metrics;
    if metrics.len() != 1 {
        return Err(invalid(
            endpoint,
            format!("expected exactly one metric, got {}", metrics.len()),
        ));
    }
    let metric = metrics.remove(0);

    let flags = match metric.is_absent {
        Some(flags) if flags.len() != metric.values.len() => {
            return Err(invalid(
                endpoint,
                format!(
                    "{} values but {} isAbsent flags",
                    metric.values.len(),
                    flags.len()
                ),
            ));
        }
        Some(flags) => flags,
        None => vec![false; metric.values.len()],
    };

    let is_absent = metric
        .values
        .iter()
        .zip(&flags)
        .map(|(value, flag)| *flag || value.is_none())
        .collect();
    let values = metric.values.iter().map(|v| v.unwrap_or(0.0)).collect();

    let series = FetchedSeries {
        name: metric.name,
        start_time: metric.start_time,
        step_time: metric.step_time,
        stop_time: metric.stop_time,
        values,
        is_absent,
    };
    series.check_shape().map_err(|e| invalid(endpoint, e))?;
    Ok(series)
}

pub fn decode_info(endpoint: &str, body: &str) -> Result<MetricInfo> {
    let response: InfoResponse =
        serde_json::from_str(body).map_err(|e| invalid(endpoint, e.to_string()))?;
    let aggregation_method: AggregationMethod = response
        .aggregation_method
        .parse()
        .map_err(|e: String| invalid(endpoint, e))?;
    Ok(MetricInfo {
        name: response.name,
        aggregation_method,
        max_retention: response.max_retention,
        x_files_factor: response.x_files_factor,
        retentions: response
            .retentions
            .iter()
            .map(|r| RetentionTier::new(r.seconds_per_point, r.number_of_points))
            .collect(),
    })
}
