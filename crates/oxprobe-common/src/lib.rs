//! Types shared by every oxprobe crate: the [`types::Point`] observation
//! emitted by agents, the [`types::Doc`] introspection manifest and
//! snowflake identifiers for hosts and probes.

pub mod id;
pub mod types;
