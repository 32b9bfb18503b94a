//! Minimal HTTP/1.0 client that runs over [`Transport::dial`], so status
//! pages are fetched from the monitored host's point of view (through the
//! SSH tunnel for remote hosts).

use anyhow::{bail, Context, Result};
use oxprobe_transport::Transport;
use std::io::{Read, Write};

/// Responses larger than this are truncated.
const MAX_RESPONSE: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Url {
    /// Parses an `http://` URL. Only plain HTTP is supported; credentials
    /// in the URL are ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// use oxprobe_collector::http::Url;
    ///
    /// let url = Url::parse("http://127.0.0.1:8080/nginx_status").unwrap();
    /// assert_eq!(url.port, 8080);
    /// assert_eq!(url.path, "/nginx_status");
    /// ```
    pub fn parse(raw: &str) -> Result<Self> {
        let parsed = url::Url::parse(raw).with_context(|| format!("invalid url '{raw}'"))?;
        if parsed.scheme() != "http" {
            bail!("unsupported url '{raw}': only http:// is supported");
        }
        let Some(host) = parsed.host_str().filter(|h| !h.is_empty()) else {
            bail!("missing host in url '{raw}'");
        };
        let port = parsed.port_or_known_default().unwrap_or(80);
        let path = match parsed.query() {
            Some(query) => format!("{}?{query}", parsed.path()),
            None => parsed.path().to_string(),
        };
        Ok(Self {
            host: host.to_string(),
            port,
            path,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

/// Performs `GET url` and returns the status code and body.
pub fn get(transport: &dyn Transport, url: &Url) -> Result<Response> {
    let mut conn = transport
        .dial("tcp", &url.address())
        .with_context(|| format!("connecting to {}", url.address()))?;
    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: oxprobe\r\nAccept: */*\r\n\r\n",
        url.path, url.host
    );
    conn.write_all(request.as_bytes())?;
    conn.flush()?;

    let mut raw = Vec::new();
    let read = (&mut conn).take(MAX_RESPONSE).read_to_end(&mut raw);
    if let Err(e) = conn.close() {
        tracing::debug!(address = %url.address(), error = %e, "Closing HTTP connection failed");
    }
    read?;
    parse_response(&raw)
}

pub(crate) fn parse_response(raw: &[u8]) -> Result<Response> {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .or_else(|| text.split_once("\n\n"))
        .unwrap_or((&*text, ""));
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => Ok(Response {
            status: code
                .parse()
                .with_context(|| format!("invalid status line '{status_line}'"))?,
            body: body.to_string(),
        }),
        _ => bail!("invalid status line '{status_line}'"),
    }
}

/// Fetches `url` and fails on anything other than `200 OK`.
pub fn get_ok(transport: &dyn Transport, url: &Url) -> Result<String> {
    let response = get(transport, url)?;
    if response.status != 200 {
        bail!("GET {}{} returned status {}", url.address(), url.path, response.status);
    }
    Ok(response.body)
}
