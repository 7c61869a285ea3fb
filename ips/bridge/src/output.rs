//! Alert and summary output
//!
//! Alerts and activity records are written one per line, as JSON or as
//! a human-readable line. The end-of-run summary goes through a
//! `SummaryExporter`.

use std::{collections::BTreeMap, fs::File, io::Write, path::PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::ValueEnum;
use serde::Serialize;

use crate::{
    config::RuntimeConfig,
    types::{
        Activity, ActivityKind, Alert, AlertKind, BridgeStats, MonitoredProcessInfo, ProcessInfo,
    },
};

/// Alert line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One JSON object per line
    Json,
    /// One human-readable line per alert
    Text,
}

#[derive(Serialize)]
struct AlertLine<'a> {
    observed_at: String,
    #[serde(flatten)]
    alert: &'a Alert,
}

#[derive(Serialize)]
struct ActivityLine<'a> {
    observed_at: String,
    stream: &'static str,
    #[serde(flatten)]
    activity: &'a Activity,
}

/// Renders alerts and activity records for stdout
#[derive(Debug, Clone, Copy)]
pub struct AlertFormatter {
    format: OutputFormat,
}

impl AlertFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Render one alert, stamped with the wall-clock time `at`
    pub fn format(&self, alert: &Alert, at: DateTime<Utc>) -> Result<String> {
        let observed_at = at.to_rfc3339_opts(SecondsFormat::Millis, true);
        match self.format {
            OutputFormat::Json => {
                let line = AlertLine { observed_at, alert };
                serde_json::to_string(&line).context("Failed to serialize alert")
            }
            OutputFormat::Text => Ok(format!("{} {}", observed_at, alert)),
        }
    }

    /// Render one activity record
    ///
    /// JSON lines carry `"stream": "activity"` so they can be told apart
    /// from alerts on the same stdout.
    pub fn format_activity(&self, activity: &Activity, at: DateTime<Utc>) -> Result<String> {
        let observed_at = at.to_rfc3339_opts(SecondsFormat::Millis, true);
        match self.format {
            OutputFormat::Json => {
                let line = ActivityLine {
                    observed_at,
                    stream: "activity",
                    activity,
                };
                serde_json::to_string(&line).context("Failed to serialize activity record")
            }
            OutputFormat::Text => Ok(format!("{} activity {}", observed_at, activity)),
        }
    }
}

/// End-of-run report
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub generated_at: String,
    pub duration_seconds: u64,
    pub runtime: RuntimeConfig,
    pub stats: BridgeStats,
    pub alerts_by_kind: BTreeMap<String, u64>,
    pub processes: Vec<ProcessInfo>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub activity_by_kind: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub monitored_processes: Vec<MonitoredProcessInfo>,
}

impl RunSummary {
    pub fn new(
        duration_seconds: u64,
        runtime: RuntimeConfig,
        stats: BridgeStats,
        alerts_by_kind: &BTreeMap<AlertKind, u64>,
        processes: Vec<ProcessInfo>,
    ) -> Self {
        Self {
            generated_at: Utc::now().to_rfc3339(),
            duration_seconds,
            runtime,
            stats,
            alerts_by_kind: alerts_by_kind
                .iter()
                .map(|(kind, n)| (kind.to_string(), *n))
                .collect(),
            processes,
            activity_by_kind: BTreeMap::new(),
            monitored_processes: Vec::new(),
        }
    }

    /// Attach what the activity monitor saw during the run
    pub fn with_activity(
        mut self,
        by_kind: &BTreeMap<ActivityKind, u64>,
        processes: Vec<MonitoredProcessInfo>,
    ) -> Self {
        self.activity_by_kind = by_kind
            .iter()
            .map(|(kind, n)| (kind.to_string(), *n))
            .collect();
        self.monitored_processes = processes;
        self
    }
}

impl RunSummary {
    /// Human-readable report, one entry per log line
    pub fn report_lines(&self) -> Vec<String> {
        let stats = &self.stats;
        let kernel = &stats.kernel;
        let rule = "============================================".to_string();

        let mut lines = vec![
            String::new(),
            rule.clone(),
            "             Summary Report".to_string(),
            rule.clone(),
            String::new(),
            format!("  Duration:           {} seconds", self.duration_seconds),
            format!("  Alerts decoded:     {}", stats.total_events),
            format!("  Tracked sources:    {}", stats.tracked_sources),
            format!("  Queue overflows:    {}", stats.queue_overflows),
            format!("  Decode errors:      {}", stats.decode_errors),
            String::new(),
            "  Alerts by kind:".to_string(),
        ];
        for (kind, count) in &self.alerts_by_kind {
            lines.push(format!("    {:<22} {:>8}", kind, count));
        }
        lines.extend([
            String::new(),
            "  Probe counters:".to_string(),
            format!("    connects seen:    {:>8}", kernel.connects_seen),
            format!("    accepts seen:     {:>8}", kernel.accepts_seen),
            format!("    ssh accepts:      {:>8}", kernel.ssh_accepts),
            format!("    alerts submitted: {:>8}", kernel.alerts_submitted),
            format!("    ring buffer full: {:>8}", kernel.ringbuf_full),
            format!("    map failures:     {:>8}", kernel.map_update_failed),
            format!("    orphan returns:   {:>8}", kernel.orphan_returns),
            format!("    non-IPv4 sockets: {:>8}", kernel.non_ipv4),
        ]);

        if stats.activity_events > 0 || !self.activity_by_kind.is_empty() {
            lines.extend([
                String::new(),
                "  Activity monitor:".to_string(),
                format!("    records decoded:  {:>8}", stats.activity_events),
                format!("    queue overflows:  {:>8}", stats.activity_overflows),
                format!("    syscalls seen:    {:>8}", kernel.syscalls_seen),
                format!("    ring buffer full: {:>8}", kernel.activity_ringbuf_full),
            ]);
            for (kind, count) in &self.activity_by_kind {
                lines.push(format!("    {:<22} {:>8}", kind, count));
            }
            let mut busiest: Vec<&MonitoredProcessInfo> =
                self.monitored_processes.iter().collect();
            busiest.sort_by(|a, b| b.syscall_count.cmp(&a.syscall_count));
            for process in busiest.into_iter().take(5) {
                lines.push(format!(
                    "    pid {:<8} {:<16} {:>8} syscalls",
                    process.pid, process.comm, process.syscall_count
                ));
            }
        }

        lines.extend([String::new(), rule]);
        lines
    }
}

/// Trait for summary exporters
pub trait SummaryExporter {
    fn export(&self, summary: &RunSummary) -> Result<()>;
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl SummaryExporter for JsonExporter {
    fn export(&self, summary: &RunSummary) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(summary)?
        } else {
            serde_json::to_string(summary)?
        };

        let mut file = File::create(&self.output_path)
            .with_context(|| format!("Failed to create output file: {:?}", self.output_path))?;

        file.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write to output file: {:?}", self.output_path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertEvent, KernelCounters};
    use chrono::TimeZone;
    use probe_common::constants::*;

    fn threshold_alert() -> Alert {
        let mut event = AlertEvent::zeroed();
        event.source_ip = u32::from(std::net::Ipv4Addr::new(10, 0, 0, 9)).to_be();
        event.source_port = 40_000;
        event.dest_port = SSH_PORT;
        event.fail_count = 5;
        event.alert_kind = ALERT_BRUTE_FORCE_THRESHOLD;
        event.process_name = *b"sshd\0\0\0\0\0\0\0\0\0\0\0\0";
        Alert::try_from(event).unwrap()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_json_line_is_flat_object() {
        let line = AlertFormatter::new(OutputFormat::Json)
            .format(&threshold_alert(), at())
            .unwrap();
        assert!(!line.contains('\n'));

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["observed_at"], "2024-05-01T12:00:00.000Z");
        assert_eq!(value["kind"], "BRUTE_FORCE_THRESHOLD");
        assert_eq!(value["fail_count"], 5);
        assert_eq!(value["process_name"], "sshd");
    }

    #[test]
    fn test_text_line() {
        let line = AlertFormatter::new(OutputFormat::Text)
            .format(&threshold_alert(), at())
            .unwrap();
        assert!(line.starts_with("2024-05-01T12:00:00.000Z BRUTE_FORCE_THRESHOLD 10.0.0.9:40000"));
        assert!(line.contains("count=5"));
    }

    #[test]
    fn test_json_exporter_writes_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");

        let mut by_kind = BTreeMap::new();
        by_kind.insert(AlertKind::SshAttempt, 2);
        by_kind.insert(AlertKind::BruteForceThreshold, 1);
        let summary = RunSummary::new(
            30,
            RuntimeConfig::default(),
            BridgeStats {
                total_events: 3,
                ..Default::default()
            },
            &by_kind,
            Vec::new(),
        );

        JsonExporter::new(path.clone(), true).export(&summary).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["duration_seconds"], 30);
        assert_eq!(value["stats"]["total_events"], 3);
        assert_eq!(value["alerts_by_kind"]["SSH_ATTEMPT"], 2);
        assert_eq!(value["alerts_by_kind"]["BRUTE_FORCE_THRESHOLD"], 1);
        assert_eq!(value["runtime"]["fail_threshold"], 5);
    }

    #[test]
    fn test_report_lists_every_kernel_counter() {
        let stats = BridgeStats {
            kernel: KernelCounters {
                orphan_returns: 7,
                non_ipv4: 11,
                ..Default::default()
            },
            ..Default::default()
        };
        let summary = RunSummary::new(
            5,
            RuntimeConfig::default(),
            stats,
            &BTreeMap::new(),
            Vec::new(),
        );
        let lines = summary.report_lines();

        assert!(lines.iter().any(|l| l.contains("orphan returns:") && l.ends_with(" 7")));
        assert!(lines.iter().any(|l| l.contains("non-IPv4 sockets:") && l.ends_with(" 11")));
        assert!(lines.iter().any(|l| l.contains("Duration:           5 seconds")));
    }

    #[test]
    fn test_activity_line_is_tagged() {
        let mut event = crate::types::ActivityEvent::zeroed();
        event.kind = ACTIVITY_FILE_OPEN;
        event.pid = 88;
        event.comm = *b"vim\0\0\0\0\0\0\0\0\0\0\0\0\0";
        event.data[..9].copy_from_slice(b"/tmp/x.rs");
        let activity = Activity::try_from(event).unwrap();

        let line = AlertFormatter::new(OutputFormat::Json)
            .format_activity(&activity, at())
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["stream"], "activity");
        assert_eq!(value["kind"], "FILE_OPEN");
        assert_eq!(value["path"], "/tmp/x.rs");

        let text = AlertFormatter::new(OutputFormat::Text)
            .format_activity(&activity, at())
            .unwrap();
        assert_eq!(
            text,
            "2024-05-01T12:00:00.000Z activity FILE_OPEN pid=88 ppid=0 uid=0 comm=vim path=/tmp/x.rs"
        );
    }

    #[test]
    fn test_report_lists_busiest_monitored_processes() {
        let stats = BridgeStats {
            activity_events: 40,
            ..Default::default()
        };
        let process = |pid, syscall_count| MonitoredProcessInfo {
            pid,
            ppid: 1,
            uid: 0,
            gid: 0,
            comm: format!("p{}", pid),
            start_time_ns: 0,
            syscall_count,
        };
        let mut by_kind = BTreeMap::new();
        by_kind.insert(ActivityKind::Syscall, 40);
        let summary = RunSummary::new(
            1,
            RuntimeConfig::default(),
            stats,
            &BTreeMap::new(),
            Vec::new(),
        )
        .with_activity(&by_kind, vec![process(10, 3), process(11, 30)]);
        let lines = summary.report_lines();

        let first = lines.iter().position(|l| l.contains("p11")).unwrap();
        let second = lines.iter().position(|l| l.contains("p10")).unwrap();
        assert!(first < second);
        assert!(lines.iter().any(|l| l.contains("SYSCALL") && l.ends_with(" 40")));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["activity_by_kind"]["SYSCALL"], 40);
        assert_eq!(json["monitored_processes"][0]["pid"], 10);
    }
}
