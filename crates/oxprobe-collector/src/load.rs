use crate::{lenient, read_text, Agent};
use anyhow::Result;
use chrono::{DateTime, Utc};
use oxprobe_common::types::{Doc, Point};
use oxprobe_transport::Transport;

const PROC_LOADAVG: &str = "/proc/loadavg";

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct LoadAvg {
    load1: f64,
    load5: f64,
    load15: f64,
    running: f64,
    threads: f64,
}

fn parse_loadavg(text: &str) -> LoadAvg {
    let mut tokens = text.split_whitespace();
    let load1 = lenient(tokens.next());
    let load5 = lenient(tokens.next());
    let load15 = lenient(tokens.next());
    let (running, threads) = tokens
        .next()
        .and_then(|t| t.split_once('/'))
        .map(|(r, t)| (lenient(Some(r)), lenient(Some(t))))
        .unwrap_or_default();
    LoadAvg {
        load1,
        load5,
        load15,
        running,
        threads,
    }
}

#[derive(Default)]
pub struct LoadAgent {
    current: Option<(LoadAvg, DateTime<Utc>)>,
}

impl LoadAgent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Agent for LoadAgent {
    fn name(&self) -> &str {
        "load"
    }

    fn gather(&mut self, transport: &dyn Transport) -> Result<()> {
        let text = read_text(transport, PROC_LOADAVG)?;
        self.current = Some((parse_loadavg(&text), Utc::now()));
        Ok(())
    }

    fn points(&self) -> Vec<Point> {
        match self.current {
            Some((load, at)) => vec![Point::new("load", at)
                .field("load1", load.load1)
                .field("load5", load.load5)
                .field("load15", load.load15)
                .field("running", load.running)
                .field("threads", load.threads)],
            None => Vec::new(),
        }
    }

    fn doc(&self) -> Doc {
        Doc::new("System load averages, from /proc/loadavg.")
            .metric("load", "load1, load5, load15, running and total scheduling entities")
    }
}
