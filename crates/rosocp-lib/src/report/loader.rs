//! Report download and CSV parsing

use super::{required_columns, MetricValues, ReportError, IDENTITY_COLUMNS, METRIC_COLUMNS, METRIC_COUNT};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Source of usage reports, addressed by URL
#[async_trait]
pub trait ReportSource: Send + Sync {
    async fn load(&self, url: &str) -> Result<CsvReport, ReportError>;
}

/// Fetches presigned report URLs over HTTP
pub struct HttpReportSource {
    client: reqwest::Client,
}

impl HttpReportSource {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReportSource for HttpReportSource {
    async fn load(&self, url: &str) -> Result<CsvReport, ReportError> {
        let fetch_err = |e: reqwest::Error| ReportError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(fetch_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(fetch_err)?;
        debug!(url = %url, bytes = body.len(), "Downloaded report");

        CsvReport::parse(&body)
    }
}

/// A parsed CSV: header plus raw records
#[derive(Debug, Clone)]
pub struct CsvReport {
    headers: Vec<String>,
    records: Vec<csv::StringRecord>,
}

/// A report row with identity columns as text and metrics coerced to floats
///
/// Empty or unparsable numeric cells become `None`, as do unparsable
/// interval bounds.
#[derive(Debug, Clone)]
pub struct ReportRow {
    pub interval_start: Option<DateTime<Utc>>,
    pub interval_end: Option<DateTime<Utc>>,
    pub container_name: String,
    pub pod: String,
    pub owner_name: String,
    pub owner_kind: String,
    pub workload: String,
    pub workload_type: String,
    pub namespace: String,
    pub image_name: String,
    pub node: String,
    pub resource_id: String,
    pub metrics: MetricValues,
}

impl CsvReport {
    /// Parse CSV bytes; the first record is the header
    pub fn parse(bytes: &[u8]) -> Result<Self, ReportError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);

        let headers = reader
            .headers()
            .map_err(|e| ReportError::Malformed(e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect::<Vec<_>>();

        let records = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ReportError::Malformed(e.to_string()))?;

        Ok(Self { headers, records })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Required columns absent from the header (exact, case-sensitive match)
    pub fn missing_columns(&self) -> Vec<String> {
        required_columns()
            .filter(|c| !self.headers.iter().any(|h| h == c))
            .map(str::to_string)
            .collect()
    }

    /// Coerce every record into a [`ReportRow`]
    pub fn typed_rows(&self) -> Result<Vec<ReportRow>, ReportError> {
        let missing = self.missing_columns();
        if !missing.is_empty() {
            return Err(ReportError::SchemaMismatch { missing });
        }

        let index: HashMap<&str, usize> = self
            .headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.as_str(), i))
            .collect();
        let pos = |name: &str| index[name];
        let identity: Vec<usize> = IDENTITY_COLUMNS.iter().map(|c| pos(c)).collect();
        let metric_pos: Vec<usize> = METRIC_COLUMNS.iter().map(|c| pos(c.name)).collect();

        let rows = self
            .records
            .iter()
            .map(|record| {
                let text = |i: usize| record.get(identity[i]).unwrap_or_default().to_string();
                let mut metrics: MetricValues = [None; METRIC_COUNT];
                for (slot, &p) in metrics.iter_mut().zip(&metric_pos) {
                    *slot = record.get(p).and_then(parse_number);
                }
                ReportRow {
                    interval_start: parse_report_time(&text(2)),
                    interval_end: parse_report_time(&text(3)),
                    container_name: text(4),
                    pod: text(5),
                    owner_name: text(6),
                    owner_kind: text(7),
                    workload: text(8),
                    workload_type: text(9),
                    namespace: text(10),
                    image_name: text(11),
                    node: text(12),
                    resource_id: text(13),
                    metrics,
                }
            })
            .collect();

        Ok(rows)
    }
}

fn parse_number(cell: &str) -> Option<f64> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    cell.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse `YYYY-MM-DD HH:MM:SS ±ZZZZ TZ`; the trailing zone name is ignored
///
/// RFC 3339 values are accepted as well.
pub fn parse_report_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let head: Vec<&str> = value.split_whitespace().take(3).collect();
    if head.len() == 3 {
        if let Ok(ts) = DateTime::parse_from_str(&head.join(" "), "%Y-%m-%d %H:%M:%S %z") {
            return Some(ts.with_timezone(&Utc));
        }
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
