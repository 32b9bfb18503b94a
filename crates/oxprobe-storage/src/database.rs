//! Time-series sinks for gathered points.

use anyhow::{Context, Result};
use async_trait::async_trait;
use oxprobe_common::types::{FieldValue, Point};
use std::fmt::Write as _;
use std::time::Duration;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Destination of gathered points.
#[async_trait]
pub trait Database: Send + Sync {
    /// Writes one batch. An error means nothing from the batch may be
    /// assumed stored; callers retry the whole batch.
    async fn write_points(&self, points: &[Point]) -> Result<()>;
}

/// Logs batches instead of storing them. Used when no database is
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDatabase;

#[async_trait]
impl Database for LogDatabase {
    async fn write_points(&self, points: &[Point]) -> Result<()> {
        for point in points {
            tracing::debug!(
                name = %point.name,
                tags = ?point.tags,
                fields = point.fields.len(),
                time = %point.time,
                "Point"
            );
        }
        Ok(())
    }
}

/// InfluxDB 1.x HTTP writer speaking line protocol.
pub struct InfluxDb {
    client: reqwest::Client,
    write_url: String,
}

impl InfluxDb {
    pub fn new(url: &str, database: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WRITE_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            write_url: format!("{}/write?db={}&precision=ns", url.trim_end_matches('/'), database),
        })
    }

    pub fn write_url(&self) -> &str {
        &self.write_url
    }
}

#[async_trait]
impl Database for InfluxDb {
    async fn write_points(&self, points: &[Point]) -> Result<()> {
        let body = line_protocol(points);
        if body.is_empty() {
            return Ok(());
        }
        let resp = self
            .client
            .post(self.write_url.as_str())
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .with_context(|| format!("POST {}", self.write_url))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("InfluxDB write returned HTTP {status}: {}", text.trim());
        }
        Ok(())
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn escape_string_field(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Renders points as InfluxDB line protocol with nanosecond timestamps.
/// Points without fields are skipped; tags and fields are sorted by key.
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use oxprobe_common::types::Point;
/// use oxprobe_storage::database::line_protocol;
///
/// let time = Utc.timestamp_opt(1, 0).unwrap();
/// let point = Point::new("load", time).tag("host", "web 1").field("load1", 0.5);
/// assert_eq!(line_protocol(&[point]), "load,host=web\\ 1 load1=0.5 1000000000\n");
/// ```
pub fn line_protocol(points: &[Point]) -> String {
    let mut out = String::new();
    for point in points.iter().filter(|p| !p.fields.is_empty()) {
        out.push_str(&escape_measurement(&point.name));

        let mut tags: Vec<_> = point.tags.iter().filter(|(_, v)| !v.is_empty()).collect();
        tags.sort();
        for (key, value) in tags {
            let _ = write!(out, ",{}={}", escape_key(key), escape_key(value));
        }

        let mut fields: Vec<_> = point.fields.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        for (i, (key, value)) in fields.into_iter().enumerate() {
            out.push(if i == 0 { ' ' } else { ',' });
            out.push_str(&escape_key(key));
            out.push('=');
            match value {
                FieldValue::Number(n) => {
                    let _ = write!(out, "{n}");
                }
                FieldValue::Bool(b) => {
                    let _ = write!(out, "{b}");
                }
                FieldValue::Text(s) => {
                    let _ = write!(out, "\"{}\"", escape_string_field(s));
                }
            }
        }

        match point.time.timestamp_nanos_opt() {
            Some(ns) => {
                let _ = writeln!(out, " {ns}");
            }
            None => out.push('\n'),
        }
    }
    out
}
