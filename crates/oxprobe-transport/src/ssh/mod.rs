//! Remote execution over pooled SSH sessions.
//!
//! Every capability is proxied through a `libssh2` session shared by all
//! probes that target the same `(host, port, username)`. File access is
//! implemented by running `cat` and `stat` on the remote side rather than
//! through SFTP.
//!
//! # Security note
//!
//! [`SshTransport::exec`] joins the command and its arguments with spaces
//! into a single shell line. Arguments are not quoted, so probe parameters
//! that reach `exec` must come from trusted configuration.

pub mod pool;

use crate::error::{Result, TransportError};
use crate::{split_address, Conn, ExecOutput, FsUsage, Transport};
use oxprobe_common::types::{Doc, ParamDoc};
use pool::{Lease, Pool, PoolKey, PooledConn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ssh2::Session;
use std::io::{Cursor, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub type SshPool = Pool<Session>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Blocking libssh2 calls give up after this many milliseconds.
const SESSION_TIMEOUT_MS: u32 = 30_000;
const KEEPALIVE_SECS: u32 = 15;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshParams {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    /// Path to a private key file. Falls back to `password`, then ssh-agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_port() -> u16 {
    22
}

pub struct SshTransport {
    params: SshParams,
    pool: Arc<SshPool>,
}

impl SshTransport {
    /// A transport with empty parameters bound to `pool`.
    pub fn new(pool: Arc<SshPool>) -> Self {
        Self {
            params: SshParams {
                port: default_port(),
                ..Default::default()
            },
            pool,
        }
    }

    pub fn with_params(pool: Arc<SshPool>, params: SshParams) -> Self {
        Self { params, pool }
    }

    fn key(&self) -> PoolKey {
        PoolKey {
            host: self.params.host.clone(),
            port: self.params.port,
            username: self.params.username.clone(),
        }
    }

    fn lease(&self) -> Result<Lease<Session>> {
        let params = &self.params;
        self.pool.acquire(&self.key(), |_| connect(params))
    }

    fn run(&self, line: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let lease = self.lease()?;
        let result = run_on(lease.client(), line);
        if let Err(e) = &result {
            // A read failure on the channel means the socket underneath is gone.
            if e.is_session_failure() || matches!(e, TransportError::Io(_)) {
                self.invalidate(&lease, e);
            }
        }
        result
    }

    fn invalidate(&self, lease: &Lease<Session>, error: &TransportError) {
        if lease.invalidate() {
            tracing::warn!(key = %self.key(), error = %error, "SSH connection dropped from pool");
        }
    }
}

fn run_on(session: &Session, line: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut channel = session.channel_session()?;
    channel.exec(line)?;

    let mut stdout = Vec::new();
    channel.read_to_end(&mut stdout)?;
    let mut stderr = Vec::new();
    channel.stderr().read_to_end(&mut stderr)?;
    channel.wait_close()?;
    let code = channel.exit_status()?;

    if code != 0 {
        return Err(TransportError::ExitStatus {
            command: line.to_string(),
            code,
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        });
    }
    Ok((stdout, stderr))
}

/// Joins command and arguments into one shell line, unquoted.
pub fn shell_line(command: &str, args: &[&str]) -> String {
    std::iter::once(command)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

fn connect(params: &SshParams) -> Result<Session> {
    let addr = (params.host.as_str(), params.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::InvalidAddress(format!("{}:{}", params.host, params.port)))?;
    let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.set_timeout(SESSION_TIMEOUT_MS);
    session.handshake()?;
    session.set_keepalive(true, KEEPALIVE_SECS);

    if let Some(key) = &params.private_key {
        session.userauth_pubkey_file(&params.username, None, Path::new(key), None)?;
    } else if let Some(password) = &params.password {
        session.userauth_password(&params.username, password)?;
    } else {
        session.userauth_agent(&params.username)?;
    }

    if !session.authenticated() {
        return Err(TransportError::AuthFailed {
            username: params.username.clone(),
            host: params.host.clone(),
        });
    }
    Ok(session)
}

impl Transport for SshTransport {
    fn name(&self) -> &str {
        "ssh"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        self.params = SshParams::deserialize(params)?;
        Ok(())
    }

    fn params(&self) -> Value {
        serde_json::to_value(&self.params).unwrap_or(Value::Null)
    }

    fn doc(&self) -> Doc {
        Doc::new("Runs probes on a remote host over a pooled SSH connection.")
            .param(ParamDoc::new("host", "string", "Remote host name or address"))
            .param(ParamDoc::new("port", "integer", "SSH port").with_default("22"))
            .param(ParamDoc::new("username", "string", "Login user"))
            .param(ParamDoc::new("private_key", "string", "Path to a private key file"))
            .param(ParamDoc::new("password", "string", "Password, used when no key is given"))
    }

    fn dial(&self, network: &str, address: &str) -> Result<Box<dyn Conn>> {
        if !matches!(network, "tcp" | "tcp4" | "tcp6") {
            return Err(TransportError::UnsupportedNetwork(network.to_string()));
        }
        let (host, port) = split_address(address)?;
        let lease = self.lease()?;
        match lease.client().channel_direct_tcpip(&host, port, None) {
            Ok(channel) => Ok(Box::new(PooledConn::new(channel, lease))),
            Err(e) => {
                let e = TransportError::from(e);
                if e.is_session_failure() {
                    self.invalidate(&lease, &e);
                }
                Err(e)
            }
        }
    }

    fn exec(&self, command: &str, args: &[&str]) -> Result<ExecOutput> {
        let (stdout, stderr) = self.run(&shell_line(command, args))?;
        Ok(ExecOutput::buffered(stdout, stderr))
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let (stdout, _) = self.run(&shell_line("cat", &[path]))?;
        Ok(Box::new(Cursor::new(stdout)))
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        Ok(self.run(&shell_line("cat", &[path]))?.0)
    }

    fn stat_filesystem(&self, path: &str) -> Result<FsUsage> {
        let line = shell_line("stat", &["-f", "-c", "'%S %b %f %a %c %d'", path]);
        let (stdout, _) = self.run(&line)?;
        parse_stat_output(&String::from_utf8_lossy(&stdout)).ok_or_else(|| {
            TransportError::UnexpectedOutput {
                command: line,
                detail: String::from_utf8_lossy(&stdout).trim().to_string(),
            }
        })
    }
}

/// Parses `stat -f -c '%S %b %f %a %c %d'` output.
fn parse_stat_output(out: &str) -> Option<FsUsage> {
    let nums: Vec<u64> = out
        .split_whitespace()
        .map(str::parse::<u64>)
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    match nums.as_slice() {
        [bsize, blocks, bfree, bavail, files, ffree] => Some(FsUsage::from_blocks(
            *bsize, *blocks, *bfree, *bavail, *files, *ffree,
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shell_line_joins_without_quoting() {
        assert_eq!(shell_line("ping", &["-c", "3", "example.com"]), "ping -c 3 example.com");
        // Documented limitation: metacharacters pass straight to the remote shell.
        assert_eq!(shell_line("cat", &["/etc/x; id"]), "cat /etc/x; id");
    }

    #[test]
    fn configure_applies_defaults_and_round_trips() {
        let pool = Arc::new(SshPool::new(pool::IDLE_TIMEOUT));
        let mut transport = SshTransport::new(pool);
        transport
            .configure(&json!({"host": "web-01", "username": "monitor"}))
            .unwrap();
        assert_eq!(transport.params.port, 22);
        assert_eq!(transport.params()["host"], "web-01");
        assert!(transport.params().get("password").is_none());
    }

    #[test]
    fn configure_rejects_missing_username() {
        let pool = Arc::new(SshPool::new(pool::IDLE_TIMEOUT));
        let mut transport = SshTransport::new(pool);
        let err = transport.configure(&json!({"host": "web-01"})).unwrap_err();
        assert!(matches!(err, TransportError::InvalidParams(_)));
    }

    #[test]
    fn stat_output_parsing() {
        let usage = parse_stat_output("4096 1000 400 300 5000 4000\n").unwrap();
        assert_eq!(usage.total, 4_096_000);
        assert_eq!(usage.available, 1_228_800);
        assert_eq!(usage.files_free, 4000);
        assert!(parse_stat_output("4096 1000").is_none());
        assert!(parse_stat_output("stat: cannot read file system information").is_none());
    }

    #[test]
    fn dial_rejects_udp_before_connecting() {
        let pool = Arc::new(SshPool::new(pool::IDLE_TIMEOUT));
        let transport = SshTransport::new(pool);
        let err = transport.dial("udp", "8.8.8.8:53").err().unwrap();
        assert!(matches!(err, TransportError::UnsupportedNetwork(_)));
    }
}
