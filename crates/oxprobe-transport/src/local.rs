use crate::error::{Result, TransportError};
use crate::{split_address, Conn, ExecOutput, FsUsage, Transport};
use oxprobe_common::types::Doc;
use serde_json::Value;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs, UdpSocket};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(10);
/// Commands still running after this long are killed.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(30);
const EXEC_POLL: Duration = Duration::from_millis(10);

/// Direct pass-through to the operating system the server runs on.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    exec_timeout: Duration,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            exec_timeout: EXEC_TIMEOUT,
        }
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        match params {
            Value::Null | Value::Object(_) => Ok(()),
            other => Err(TransportError::InvalidParams(serde::de::Error::custom(
                format!("local transport takes no parameters, got {other}"),
            ))),
        }
    }

    fn params(&self) -> Value {
        Value::Object(serde_json::Map::new())
    }

    fn doc(&self) -> Doc {
        Doc::new("Runs probes directly on the machine hosting the scheduler.")
    }

    fn dial(&self, network: &str, address: &str) -> Result<Box<dyn Conn>> {
        match network {
            "tcp" | "tcp4" | "tcp6" => Ok(Box::new(dial_tcp(address)?)),
            "udp" | "udp4" | "udp6" => Ok(Box::new(dial_udp(address)?)),
            other => Err(TransportError::UnsupportedNetwork(other.to_string())),
        }
    }

    fn exec(&self, command: &str, args: &[&str]) -> Result<ExecOutput> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        // Drain both pipes while waiting so a chatty child cannot block on a
        // full pipe buffer.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match wait_until(&mut child, Instant::now() + self.exec_timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                if let Err(e) = child.kill() {
                    tracing::debug!(command, error = %e, "Killing timed out command failed");
                }
                let _ = child.wait();
                return Err(TransportError::Timeout {
                    command: command.to_string(),
                    after: self.exec_timeout,
                });
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };
        let stdout = collect(stdout)?;
        let stderr = collect(stderr)?;

        if !status.success() {
            return Err(TransportError::ExitStatus {
                command: command.to_string(),
                code: status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        Ok(ExecOutput::buffered(stdout, stderr))
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::fs::File::open(path)?))
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(path)?)
    }

    #[cfg(unix)]
    fn stat_filesystem(&self, path: &str) -> Result<FsUsage> {
        let st = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        Ok(FsUsage::from_blocks(
            st.fragment_size() as u64,
            st.blocks() as u64,
            st.blocks_free() as u64,
            st.blocks_available() as u64,
            st.files() as u64,
            st.files_free() as u64,
        ))
    }

    #[cfg(not(unix))]
    fn stat_filesystem(&self, _path: &str) -> Result<FsUsage> {
        Err(TransportError::Unsupported("stat_filesystem"))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<io::Result<Vec<u8>>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

fn collect(reader: Option<JoinHandle<io::Result<Vec<u8>>>>) -> Result<Vec<u8>> {
    match reader {
        Some(handle) => handle
            .join()
            .map_err(|_| io::Error::other("output reader panicked"))?
            .map_err(TransportError::from),
        None => Ok(Vec::new()),
    }
}

/// Polls `child` until it exits or `deadline` passes. `None` means the
/// deadline passed first.
fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<Option<std::process::ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(EXEC_POLL);
    }
}

fn dial_tcp(address: &str) -> Result<TcpStream> {
    let (host, port) = split_address(address)?;
    let mut last_err = None;
    for addr in (host.as_str(), port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, DIAL_TIMEOUT) {
            Ok(stream) => {
                stream.set_read_timeout(Some(IO_TIMEOUT))?;
                stream.set_write_timeout(Some(IO_TIMEOUT))?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {address}")))
        .into())
}

fn dial_udp(address: &str) -> Result<UdpConn> {
    let (host, port) = split_address(address)?;
    let target = (host.as_str(), port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {address}")))?;
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(target)?;
    socket.set_read_timeout(Some(IO_TIMEOUT))?;
    Ok(UdpConn(socket))
}

impl Conn for TcpStream {
    fn close(&mut self) -> Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Connected datagram socket. Each read returns one datagram.
pub struct UdpConn(UdpSocket);

impl Read for UdpConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.recv(buf)
    }
}

impl Write for UdpConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Conn for UdpConn {
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn read_file_and_open_return_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loadavg");
        std::fs::write(&path, "0.10 0.20 0.30 1/100 42\n").unwrap();
        let path = path.to_str().unwrap();

        let transport = LocalTransport::new();
        assert_eq!(transport.read_file(path).unwrap(), b"0.10 0.20 0.30 1/100 42\n");

        let mut s = String::new();
        transport.open(path).unwrap().read_to_string(&mut s).unwrap();
        assert!(s.starts_with("0.10"));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = LocalTransport::new().read_file("/definitely/not/here").unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[cfg(unix)]
    #[test]
    fn exec_captures_stdout_and_reports_exit_status() {
        let transport = LocalTransport::new();
        let out = transport.exec("echo", &["hello", "world"]).unwrap();
        assert_eq!(out.stdout_string().unwrap().trim(), "hello world");

        let err = transport.exec("sh", &["-c", "echo boom >&2; exit 3"]).err().unwrap();
        match err {
            TransportError::ExitStatus { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn exec_kills_commands_that_outlive_the_timeout() {
        let transport = LocalTransport::new().with_exec_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let err = transport.exec("sleep", &["5"]).err().unwrap();
        assert!(matches!(err, TransportError::Timeout { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[test]
    fn exec_drains_large_output() {
        let transport = LocalTransport::new().with_exec_timeout(Duration::from_secs(10));
        let mut out = transport
            .exec("sh", &["-c", "head -c 1000000 /dev/zero | tr '\\0' x; echo done >&2"])
            .unwrap();
        let mut stderr = String::new();
        out.stderr.read_to_string(&mut stderr).unwrap();
        assert_eq!(stderr.trim(), "done");
        assert_eq!(out.stdout_string().unwrap().len(), 1_000_000);
    }

    #[test]
    fn dial_tcp_connects_and_close_is_repeatable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"pong").unwrap();
        });

        let transport = LocalTransport::new();
        let mut conn = transport.dial("tcp", &addr.to_string()).unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
        accept.join().unwrap();

        conn.close().unwrap();
        conn.close().unwrap();
    }

    #[test]
    fn dial_rejects_unknown_network() {
        let err = LocalTransport::new().dial("unix", "/tmp/x:1").err().unwrap();
        assert!(matches!(err, TransportError::UnsupportedNetwork(_)));
    }

    #[cfg(unix)]
    #[test]
    fn stat_filesystem_reports_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let usage = LocalTransport::new()
            .stat_filesystem(dir.path().to_str().unwrap())
            .unwrap();
        assert!(usage.total > 0);
        assert!(usage.available <= usage.total);
    }
}
