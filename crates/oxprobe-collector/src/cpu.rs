use crate::delta::{Counters, DeltaTracker, Kind, COUNT_PRECISION, TICK_PRECISION};
use crate::{lenient, read_text, Agent};
use anyhow::Result;
use chrono::{DateTime, Utc};
use oxprobe_common::types::{Doc, Point};
use oxprobe_transport::Transport;
use std::collections::HashMap;

const PROC_STAT: &str = "/proc/stat";

/// Column order of a `cpu`/`cpuN` line in /proc/stat.
const CPU_COLUMNS: [&str; 10] = [
    "user", "nice", "system", "idle", "iowait", "irq", "softirq", "steal", "guest", "guest_nice",
];

/// Single-value lines of /proc/stat: (line key, field name, kind).
const KERNEL_LINES: [(&str, &str, Kind); 5] = [
    ("ctxt", "context_switches", Kind::Counter),
    ("intr", "interrupts", Kind::Counter),
    ("processes", "forks", Kind::Counter),
    ("procs_running", "running", Kind::Gauge),
    ("procs_blocked", "blocked", Kind::Gauge),
];

#[derive(Debug, Default)]
pub(crate) struct StatSample {
    /// Keyed by the core label: `"all"` for the aggregate line, else the index.
    pub cores: HashMap<String, Counters>,
    pub counters: Counters,
    pub gauges: Counters,
}

pub(crate) fn parse_stat(text: &str) -> StatSample {
    let mut sample = StatSample::default();
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        let Some(key) = tokens.next() else { continue };

        if let Some(index) = key.strip_prefix("cpu") {
            let core = if index.is_empty() { "all" } else { index };
            let counters = CPU_COLUMNS
                .iter()
                .map(|col| (col.to_string(), lenient(tokens.next())))
                .collect();
            sample.cores.insert(core.to_string(), counters);
            continue;
        }

        if let Some((_, field, kind)) = KERNEL_LINES.iter().find(|(k, _, _)| *k == key) {
            let value = lenient(tokens.next());
            match kind {
                Kind::Counter => sample.counters.insert(field.to_string(), value),
                Kind::Gauge => sample.gauges.insert(field.to_string(), value),
            };
        }
    }
    sample
}

/// Per-core CPU time rates (ticks per second) and kernel activity.
pub struct CpuAgent {
    ticks: DeltaTracker,
    kernel: DeltaTracker,
    core_rates: HashMap<String, Counters>,
    kernel_rates: Counters,
    gauges: Counters,
    captured_at: Option<DateTime<Utc>>,
}

impl CpuAgent {
    pub fn new() -> Self {
        Self {
            ticks: DeltaTracker::new(TICK_PRECISION),
            kernel: DeltaTracker::new(COUNT_PRECISION),
            core_rates: HashMap::new(),
            kernel_rates: Counters::new(),
            gauges: Counters::new(),
            captured_at: None,
        }
    }

    fn ingest(&mut self, text: &str, at: DateTime<Utc>) -> Result<()> {
        let sample = parse_stat(text);
        if sample.cores.is_empty() {
            anyhow::bail!("no cpu lines in {PROC_STAT}");
        }
        self.core_rates = self.ticks.update(sample.cores, at);
        self.kernel_rates = self.kernel.update_one(sample.counters, at).unwrap_or_default();
        self.gauges = sample.gauges;
        self.captured_at = Some(at);
        Ok(())
    }
}

impl Default for CpuAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for CpuAgent {
    fn name(&self) -> &str {
        "cpu"
    }

    fn gather(&mut self, transport: &dyn Transport) -> Result<()> {
        let text = read_text(transport, PROC_STAT)?;
        self.ingest(&text, Utc::now())
    }

    fn points(&self) -> Vec<Point> {
        let Some(at) = self.captured_at else {
            return Vec::new();
        };
        let mut cores: Vec<_> = self.core_rates.iter().collect();
        cores.sort_by(|a, b| a.0.cmp(b.0));

        let mut points: Vec<Point> = cores
            .into_iter()
            .map(|(core, rates)| {
                Point::new("cpu", at)
                    .tag("core", core.as_str())
                    .fields(rates.iter().map(|(k, v)| (k.clone(), *v)))
            })
            .collect();

        let kernel = Point::new("cpu.kernel", at)
            .fields(self.kernel_rates.iter().map(|(k, v)| (k.clone(), *v)))
            .fields(self.gauges.iter().map(|(k, v)| (k.clone(), *v)));
        if !kernel.fields.is_empty() {
            points.push(kernel);
        }
        points
    }

    fn doc(&self) -> Doc {
        Doc::new("CPU time spent per state, from /proc/stat.")
            .metric("cpu", "Ticks per second per state (user, system, idle...), tagged by core")
            .metric("cpu.kernel", "Context switches, interrupts and forks per second; running and blocked processes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use chrono::Duration;

    const STAT_T0: &str = "\
cpu  100 0 50 1000 10 0 5 0 0 0
cpu0 60 0 30 500 5 0 3 0 0 0
cpu1 40 0 20 500 5 0 2 0 0 0
intr 5000 10 20
ctxt 20000
btime 1700000000
processes 300
procs_running 2
procs_blocked 0
";

    const STAT_T1: &str = "\
cpu  150 0 70 1200 10 0 5 0 0 0
cpu0 90 0 40 600 5 0 3 0 0 0
cpu1 60 0 30 600 5 0 2 0 0 0
intr 6000 10 20
ctxt 21000
btime 1700000000
processes 310
procs_running 3
procs_blocked 1
";

    fn field(points: &[Point], name: &str, core: Option<&str>, key: &str) -> f64 {
        points
            .iter()
            .find(|p| p.name == name && p.tags.get("core").map(String::as_str) == core)
            .and_then(|p| p.fields.get(key))
            .and_then(|v| v.as_f64())
            .unwrap()
    }

    #[test]
    fn cold_start_reports_gauges_only() {
        let mut agent = CpuAgent::new();
        let transport = FakeTransport::new().with_file(PROC_STAT, STAT_T0);
        agent.gather(&transport).unwrap();

        let points = agent.points();
        assert!(points.iter().all(|p| p.name != "cpu"));
        assert_eq!(field(&points, "cpu.kernel", None, "running"), 2.0);
        assert!(!points[0].fields.contains_key("context_switches"));
    }

    #[test]
    fn second_sample_yields_tick_rates() {
        let t0 = Utc::now();
        let mut agent = CpuAgent::new();
        agent.ingest(STAT_T0, t0).unwrap();
        agent.ingest(STAT_T1, t0 + Duration::seconds(10)).unwrap();

        let points = agent.points();
        assert_eq!(field(&points, "cpu", Some("all"), "user"), 5.0);
        assert_eq!(field(&points, "cpu", Some("all"), "system"), 2.0);
        assert_eq!(field(&points, "cpu", Some("0"), "user"), 3.0);
        assert_eq!(field(&points, "cpu", Some("1"), "idle"), 10.0);
        assert_eq!(field(&points, "cpu.kernel", None, "context_switches"), 100.0);
        assert_eq!(field(&points, "cpu.kernel", None, "interrupts"), 100.0);
        assert_eq!(field(&points, "cpu.kernel", None, "forks"), 1.0);
        assert_eq!(field(&points, "cpu.kernel", None, "blocked"), 1.0);
    }

    #[test]
    fn truncated_lines_are_zero_filled() {
        let t0 = Utc::now();
        let mut agent = CpuAgent::new();
        agent.ingest("cpu 100 20\ncpu0 abc 5 5\nctxt\n", t0).unwrap();
        agent
            .ingest("cpu 110 20\ncpu0 abc 7 5\nctxt\n", t0 + Duration::seconds(1))
            .unwrap();

        let points = agent.points();
        assert_eq!(field(&points, "cpu", Some("all"), "user"), 10.0);
        assert_eq!(field(&points, "cpu", Some("all"), "steal"), 0.0);
        assert_eq!(field(&points, "cpu", Some("0"), "user"), 0.0);
        assert_eq!(field(&points, "cpu", Some("0"), "nice"), 2.0);
    }

    #[test]
    fn missing_or_empty_source_is_an_error() {
        let mut agent = CpuAgent::new();
        assert!(agent.gather(&FakeTransport::new()).is_err());

        let transport = FakeTransport::new().with_file(PROC_STAT, "garbage\n");
        assert!(agent.gather(&transport).is_err());
        assert!(agent.points().is_empty());
    }
}
