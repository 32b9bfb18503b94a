use crate::Agent;
use anyhow::Result;
use chrono::{DateTime, Utc};
use oxprobe_common::types::{Doc, ParamDoc, Point};
use oxprobe_transport::{FsUsage, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskUsageParams {
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for DiskUsageParams {
    fn default() -> Self {
        Self {
            path: default_path(),
        }
    }
}

/// Capacity of the filesystem holding `path`.
#[derive(Default)]
pub struct DiskUsageAgent {
    params: DiskUsageParams,
    current: Option<(FsUsage, DateTime<Utc>)>,
}

impl DiskUsageAgent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Agent for DiskUsageAgent {
    fn name(&self) -> &str {
        "diskusage"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        self.params = match params {
            Value::Null => DiskUsageParams::default(),
            other => serde_json::from_value(other.clone())?,
        };
        Ok(())
    }

    fn params(&self) -> Value {
        serde_json::to_value(&self.params).unwrap_or(Value::Null)
    }

    fn gather(&mut self, transport: &dyn Transport) -> Result<()> {
        let usage = transport.stat_filesystem(&self.params.path)?;
        self.current = Some((usage, Utc::now()));
        Ok(())
    }

    fn points(&self) -> Vec<Point> {
        let Some((usage, at)) = self.current else {
            return Vec::new();
        };
        let used = usage.used();
        // Matches df(1): percentage of the space usable by non-root users.
        let usable = used + usage.available;
        let used_percent = if usable > 0 {
            used as f64 / usable as f64 * 100.0
        } else {
            0.0
        };
        let point = Point::new("disk.usage", at)
            .tag("mount", self.params.path.as_str())
            .field("total", usage.total)
            .field("free", usage.free)
            .field("available", usage.available)
            .field("used", used)
            .field("used_percent", used_percent)
            .field("inodes_total", usage.files)
            .field("inodes_free", usage.files_free)
            .field("inodes_used", usage.files.saturating_sub(usage.files_free));
        vec![point]
    }

    fn doc(&self) -> Doc {
        Doc::new("Filesystem capacity and inode usage for one mount point.")
            .param(ParamDoc::new("path", "string", "Any path on the filesystem to inspect").with_default("/"))
            .metric("disk.usage", "total, free, available, used bytes, used_percent, inodes; tagged by mount")
    }
}
