//! Measurement agents for oxprobe.
//!
//! Each [`Agent`] implementation gathers one category of metrics (CPU,
//! memory, a service status page...) through a [`Transport`] and exposes
//! the result as a vector of [`Point`]s. Counter-based agents keep their
//! previous sample in a [`delta::DeltaTracker`] so that the scheduler,
//! which holds one agent instance per probe, gets per-second rates from
//! the second gather onwards.

pub mod cpu;
pub mod delta;
pub mod disk;
pub mod diskusage;
pub mod dns;
pub mod error;
pub mod http;
pub mod load;
pub mod memory;
pub mod mysql;
pub mod network;
pub mod nginx;
pub mod phpfpm;
pub mod ping;
pub mod registry;
pub mod sockets;
pub mod tcpport;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use oxprobe_common::types::{Doc, Point};
use oxprobe_transport::Transport;
use serde_json::Value;

pub use registry::Registry;

/// A pluggable measurement unit.
///
/// `gather` does the I/O and updates internal state; `points` is a pure read
/// of that state. Agents must tolerate partially malformed input: a field
/// that cannot be parsed is left at zero and gathering continues.
pub trait Agent: Send {
    /// Registry name of this agent (e.g. `"cpu"`, `"nginx"`).
    fn name(&self) -> &str;

    /// Applies parameters decoded from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when `params` does not match the agent's schema.
    fn configure(&mut self, params: &Value) -> Result<()> {
        no_params(self.name(), params)
    }

    /// Current parameters in serialized form.
    fn params(&self) -> Value {
        Value::Object(serde_json::Map::new())
    }

    /// Collects a fresh sample through `transport`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or when the source cannot be parsed
    /// at all.
    fn gather(&mut self, transport: &dyn Transport) -> Result<()>;

    /// Points derived from the most recent gather.
    fn points(&self) -> Vec<Point>;

    fn doc(&self) -> Doc;
}

fn no_params(name: &str, params: &Value) -> Result<()> {
    match params {
        Value::Null => Ok(()),
        Value::Object(map) if map.is_empty() => Ok(()),
        other => anyhow::bail!("agent '{name}' takes no parameters, got {other}"),
    }
}

/// Parses a numeric token, treating anything unparsable as zero.
pub(crate) fn lenient(token: Option<&str>) -> f64 {
    token.and_then(|t| t.trim().parse::<f64>().ok()).unwrap_or(0.0)
}

/// Reads a pseudo-file through the transport as UTF-8 text.
pub(crate) fn read_text(transport: &dyn Transport, path: &str) -> Result<String> {
    let bytes = transport.read_file(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
