//! Ways of reaching a monitored host.
//!
//! Agents never touch the operating system directly: every file read,
//! command execution and network dial goes through a [`Transport`]. The
//! [`local::LocalTransport`] talks to the machine the server runs on, the
//! [`ssh::SshTransport`] proxies the same capabilities over pooled SSH
//! sessions.

pub mod error;
pub mod local;
pub mod ssh;

use error::Result;
use oxprobe_common::types::Doc;
use serde_json::Value;
use std::io::{Read, Write};

pub use error::TransportError;

/// An open network connection returned by [`Transport::dial`].
pub trait Conn: Read + Write + Send {
    /// Closes the connection. Calling it more than once is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Captured output of [`Transport::exec`].
pub struct ExecOutput {
    pub stdout: Box<dyn Read + Send>,
    pub stderr: Box<dyn Read + Send>,
}

impl std::fmt::Debug for ExecOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecOutput").finish_non_exhaustive()
    }
}

impl ExecOutput {
    /// Convenience constructor for fully buffered output.
    pub fn buffered(stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            stdout: Box::new(std::io::Cursor::new(stdout)),
            stderr: Box::new(std::io::Cursor::new(stderr)),
        }
    }

    /// Drains stdout into a string, replacing invalid UTF-8.
    pub fn stdout_string(mut self) -> Result<String> {
        let mut buf = Vec::new();
        self.stdout.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Filesystem capacity as reported by `statvfs(3)`, in bytes and inodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsUsage {
    pub total: u64,
    pub free: u64,
    /// Space available to unprivileged users.
    pub available: u64,
    pub files: u64,
    pub files_free: u64,
}

impl FsUsage {
    pub fn from_blocks(
        block_size: u64,
        blocks: u64,
        blocks_free: u64,
        blocks_available: u64,
        files: u64,
        files_free: u64,
    ) -> Self {
        Self {
            total: blocks.saturating_mul(block_size),
            free: blocks_free.saturating_mul(block_size),
            available: blocks_available.saturating_mul(block_size),
            files,
            files_free,
        }
    }

    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }
}

/// Capability set every agent uses to reach its target host.
///
/// Implementations are blocking; the scheduler runs agents on a blocking
/// thread pool so a slow remote call never stalls the tick loop.
pub trait Transport: Send + Sync {
    /// Registry name of this transport (`"local"`, `"ssh"`).
    fn name(&self) -> &str;

    /// Applies transport-specific parameters decoded from configuration.
    fn configure(&mut self, params: &Value) -> Result<()>;

    /// Current parameters in their serialized form.
    fn params(&self) -> Value;

    fn doc(&self) -> Doc;

    /// Opens a connection to `address` (`host:port`) over `network`.
    fn dial(&self, network: &str, address: &str) -> Result<Box<dyn Conn>>;

    /// Runs `command` with `args` and captures its output.
    fn exec(&self, command: &str, args: &[&str]) -> Result<ExecOutput>;

    /// Opens `path` for streaming reads. Dropping the reader releases it.
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut reader = self.open(path)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn stat_filesystem(&self, path: &str) -> Result<FsUsage>;
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub(crate) fn split_address(address: &str) -> Result<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(TransportError::InvalidAddress(address.to_string()));
    }
    Ok((host.to_string(), port))
}
