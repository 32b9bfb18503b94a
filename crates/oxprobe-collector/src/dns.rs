use crate::Agent;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use hickory_resolver::proto::op::{Message, MessageType, OpCode, Query};
use hickory_resolver::proto::rr::{Name, RecordType};
use oxprobe_common::types::{Doc, ParamDoc, Point};
use oxprobe_transport::{Conn, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Instant;

/// Largest UDP answer accepted without EDNS.
const UDP_BUFFER: usize = 4096;

fn default_server() -> String {
    "127.0.0.1:53".to_string()
}

fn default_query() -> String {
    "example.com.".to_string()
}

fn default_record_type() -> String {
    "A".to_string()
}

fn default_network() -> String {
    "udp".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsParams {
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_query")]
    pub query: String,
    #[serde(default = "default_record_type")]
    pub record_type: String,
    /// `udp` or `tcp`. Remote (SSH) hosts only support `tcp`.
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for DnsParams {
    fn default() -> Self {
        Self {
            server: default_server(),
            query: default_query(),
            record_type: default_record_type(),
            network: default_network(),
        }
    }
}

impl DnsParams {
    fn validate(&self) -> Result<(Name, RecordType)> {
        if !matches!(self.network.as_str(), "udp" | "tcp") {
            bail!("unsupported network '{}', expected udp or tcp", self.network);
        }
        let name = Name::from_ascii(&self.query)
            .with_context(|| format!("invalid query name '{}'", self.query))?;
        let record_type = RecordType::from_str(&self.record_type.to_uppercase())
            .with_context(|| format!("invalid record type '{}'", self.record_type))?;
        Ok((name, record_type))
    }
}

#[derive(Debug, Clone)]
struct Answer {
    query_time_ms: f64,
    answers: usize,
    rcode: u16,
    at: DateTime<Utc>,
}

pub(crate) fn build_query(id: u16, name: Name, record_type: RecordType) -> Result<Vec<u8>> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));
    Ok(message.to_vec()?)
}

fn exchange(conn: &mut dyn Conn, network: &str, request: &[u8]) -> Result<Vec<u8>> {
    if network == "tcp" {
        let len = u16::try_from(request.len()).context("query too large")?;
        let mut framed = Vec::with_capacity(request.len() + 2);
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(request);
        conn.write_all(&framed)?;
        let mut prefix = [0u8; 2];
        conn.read_exact(&mut prefix)?;
        let mut response = vec![0u8; usize::from(u16::from_be_bytes(prefix))];
        conn.read_exact(&mut response)?;
        Ok(response)
    } else {
        conn.write_all(request)?;
        let mut buf = vec![0u8; UDP_BUFFER];
        let n = conn.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// Resolves one name against a given server and records the round trip.
#[derive(Default)]
pub struct DnsAgent {
    params: DnsParams,
    answer: Option<Answer>,
}

impl DnsAgent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Agent for DnsAgent {
    fn name(&self) -> &str {
        "dns"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        let params: DnsParams = match params {
            Value::Null => DnsParams::default(),
            other => serde_json::from_value(other.clone())?,
        };
        params.validate()?;
        self.params = params;
        Ok(())
    }

    fn params(&self) -> Value {
        serde_json::to_value(&self.params).unwrap_or(Value::Null)
    }

    fn gather(&mut self, transport: &dyn Transport) -> Result<()> {
        let (name, record_type) = self.params.validate()?;
        let id: u16 = rand::random();
        let request = build_query(id, name, record_type)?;

        let started = Instant::now();
        let mut conn = transport
            .dial(&self.params.network, &self.params.server)
            .with_context(|| format!("connecting to DNS server {}", self.params.server))?;
        let exchanged = exchange(&mut *conn, &self.params.network, &request);
        let query_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Err(e) = conn.close() {
            tracing::debug!(server = %self.params.server, error = %e, "Closing DNS connection failed");
        }

        let response = Message::from_vec(&exchanged?).context("malformed DNS response")?;
        if response.id() != id {
            bail!("DNS response id {} does not match query id {id}", response.id());
        }
        self.answer = Some(Answer {
            query_time_ms,
            answers: response.answers().len(),
            rcode: u16::from(response.response_code()),
            at: Utc::now(),
        });
        Ok(())
    }

    fn points(&self) -> Vec<Point> {
        let Some(answer) = &self.answer else {
            return Vec::new();
        };
        vec![Point::new("dns", answer.at)
            .tag("server", self.params.server.as_str())
            .tag("domain", self.params.query.as_str())
            .tag("record_type", self.params.record_type.as_str())
            .field("query_time_ms", answer.query_time_ms)
            .field("answers", answer.answers as u64)
            .field("rcode", u64::from(answer.rcode))]
    }

    fn doc(&self) -> Doc {
        Doc::new("DNS query round trip against a specific server.")
            .param(ParamDoc::new("server", "string", "host:port of the DNS server").with_default("127.0.0.1:53"))
            .param(ParamDoc::new("query", "string", "Name to resolve").with_default("example.com."))
            .param(ParamDoc::new("record_type", "string", "Record type to ask for").with_default("A"))
            .param(ParamDoc::new("network", "string", "udp or tcp").with_default("udp"))
            .metric("dns", "query_time_ms, answers, rcode; tagged by server, domain, record_type")
    }
}
