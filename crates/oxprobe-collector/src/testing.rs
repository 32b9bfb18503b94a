//! In-memory transport used by agent unit tests.

use oxprobe_common::types::Doc;
use oxprobe_transport::error::{Result, TransportError};
use oxprobe_transport::{Conn, ExecOutput, FsUsage, Transport};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};

type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;
type DialError = Arc<dyn Fn() -> TransportError + Send + Sync>;

#[derive(Default)]
pub struct FakeTransport {
    files: HashMap<String, String>,
    commands: HashMap<String, std::result::Result<String, (i32, String)>>,
    responder: Option<Responder>,
    dial_error: Option<DialError>,
    fs: Option<FsUsage>,
    pub exec_log: Mutex<Vec<Vec<String>>>,
    pub dialed: Mutex<Vec<(String, String)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.to_string(), content.to_string());
        self
    }

    pub fn with_command(mut self, command: &str, stdout: &str) -> Self {
        self.commands.insert(command.to_string(), Ok(stdout.to_string()));
        self
    }

    pub fn with_failing_command(mut self, command: &str, code: i32, stderr: &str) -> Self {
        self.commands
            .insert(command.to_string(), Err((code, stderr.to_string())));
        self
    }

    /// Every dialed connection answers with `respond(request_bytes)`.
    pub fn with_responder<F>(mut self, respond: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(respond));
        self
    }

    /// Every dial fails with `error()`.
    pub fn with_dial_error<F>(mut self, error: F) -> Self
    where
        F: Fn() -> TransportError + Send + Sync + 'static,
    {
        self.dial_error = Some(Arc::new(error));
        self
    }

    pub fn with_fs(mut self, usage: FsUsage) -> Self {
        self.fs = Some(usage);
        self
    }
}

fn not_found(what: &str) -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::NotFound, what.to_string()))
}

impl Transport for FakeTransport {
    fn name(&self) -> &str {
        "fake"
    }

    fn configure(&mut self, _params: &Value) -> Result<()> {
        Ok(())
    }

    fn params(&self) -> Value {
        Value::Null
    }

    fn doc(&self) -> Doc {
        Doc::new("test transport")
    }

    fn dial(&self, network: &str, address: &str) -> Result<Box<dyn Conn>> {
        self.dialed
            .lock()
            .unwrap()
            .push((network.to_string(), address.to_string()));
        if let Some(error) = &self.dial_error {
            return Err(error());
        }
        let responder = self.responder.clone().ok_or_else(|| {
            TransportError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        })?;
        Ok(Box::new(FakeConn {
            written: Vec::new(),
            response: None,
            responder,
        }))
    }

    fn exec(&self, command: &str, args: &[&str]) -> Result<ExecOutput> {
        let mut line = vec![command.to_string()];
        line.extend(args.iter().map(|a| a.to_string()));
        self.exec_log.lock().unwrap().push(line);
        match self.commands.get(command) {
            Some(Ok(stdout)) => Ok(ExecOutput::buffered(stdout.clone().into_bytes(), Vec::new())),
            Some(Err((code, stderr))) => Err(TransportError::ExitStatus {
                command: command.to_string(),
                code: *code,
                stderr: stderr.clone(),
            }),
            None => Err(not_found(command)),
        }
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let content = self.files.get(path).ok_or_else(|| not_found(path))?;
        Ok(Box::new(Cursor::new(content.clone().into_bytes())))
    }

    fn stat_filesystem(&self, path: &str) -> Result<FsUsage> {
        self.fs.ok_or_else(|| not_found(path))
    }
}

struct FakeConn {
    written: Vec<u8>,
    response: Option<Cursor<Vec<u8>>>,
    responder: Responder,
}

impl Read for FakeConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.response.is_none() {
            self.response = Some(Cursor::new((self.responder)(&self.written)));
        }
        match self.response.as_mut() {
            Some(cursor) => cursor.read(buf),
            None => Ok(0),
        }
    }
}

impl Write for FakeConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Conn for FakeConn {
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
