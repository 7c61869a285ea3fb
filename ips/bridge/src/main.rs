//! eBPF SSH brute-force probe - userspace daemon
//!
//! Loads the IPS probes, prints every alert to stdout and optionally
//! writes a JSON summary when it exits.
//!
//! ## Usage
//!
//! ```bash
//! # Run until Ctrl-C, alerts as JSON lines
//! sudo ./ips-bridge --ebpf-object path/to/ips-probe
//!
//! # Stricter detection for ten minutes, human-readable alerts
//! sudo ./ips-bridge --fail-threshold 3 --window-secs 60 --duration 600 --format text
//!
//! # Settings from a file, summary on exit
//! sudo ./ips-bridge --config ips.json --stats-output ips-summary.json
//!
//! # Also trace file opens and TCP traffic of one process
//! sudo ./ips-bridge --trace-files --trace-network --target-pid 4242
//! ```

use std::{
    collections::BTreeMap,
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use ips_bridge::{
    output::{AlertFormatter, JsonExporter, OutputFormat, RunSummary, SummaryExporter},
    ActivityKind, AlertKind, BridgeConfig, BridgeStats, KernelBridge, MonitorSettings,
};
use log::{error, info, warn};
use tokio::{
    signal,
    time::{interval, sleep, Instant},
};

/// SSH brute-force detection using eBPF
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; flags below override its values
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Path to eBPF object file (if not embedded)
    #[clap(long)]
    ebpf_object: Option<PathBuf>,

    /// Duration to run (in seconds, 0 = until interrupted)
    #[clap(short, long, default_value_t = 0)]
    duration: u64,

    /// Alert output format
    #[clap(short, long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Accepts from one source within the window before a threshold alert
    #[clap(long)]
    fail_threshold: Option<u32>,

    /// Sliding window length in seconds
    #[clap(long)]
    window_secs: Option<u64>,

    /// Report every outbound connection, not only SSH
    #[clap(long)]
    monitor_all: bool,

    /// Load the probes with detection switched off
    #[clap(long)]
    disabled: bool,

    /// Alert ring buffer size in bytes
    #[clap(long)]
    ring_buffer_bytes: Option<u32>,

    /// Source IPs tracked before LRU eviction
    #[clap(long)]
    tracked_ips: Option<u32>,

    /// Pull queue capacity
    #[clap(long)]
    queue_capacity: Option<usize>,

    /// Ring buffer poll interval in milliseconds
    #[clap(long)]
    poll_interval_ms: Option<u64>,

    /// Trace every syscall entry and count syscalls per process
    #[clap(long)]
    trace_syscalls: bool,

    /// Trace kernel file opens
    #[clap(long)]
    trace_files: bool,

    /// Trace TCP send and receive calls
    #[clap(long)]
    trace_network: bool,

    /// Trace process forks and exits
    #[clap(long)]
    trace_processes: bool,

    /// Restrict activity tracing to one process (turns syscall tracing on
    /// when no other tracing is selected)
    #[clap(long)]
    target_pid: Option<u32>,

    /// Activity ring buffer size in bytes
    #[clap(long)]
    activity_ring_bytes: Option<u32>,

    /// Write a JSON run summary here on exit
    #[clap(long)]
    stats_output: Option<PathBuf>,

    /// Progress reporting interval in seconds (0 = off)
    #[clap(long, default_value_t = 10)]
    progress_interval: u64,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

impl Args {
    fn bridge_config(&self) -> Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::from_file(path)?,
            None => BridgeConfig::default(),
        };

        if self.ebpf_object.is_some() {
            config.ebpf_object = self.ebpf_object.clone();
        }
        if let Some(v) = self.ring_buffer_bytes {
            config.ring_buffer_bytes = v;
        }
        if let Some(v) = self.tracked_ips {
            config.tracked_ip_capacity = v;
        }
        if let Some(v) = self.queue_capacity {
            config.queue_capacity = v;
        }
        if let Some(v) = self.poll_interval_ms {
            config.poll_interval_ms = v;
        }
        if let Some(v) = self.fail_threshold {
            config.runtime.fail_threshold = v;
        }
        if let Some(v) = self.window_secs {
            config.runtime.window_secs = v;
        }
        if self.monitor_all {
            config.runtime.monitor_all_connections = true;
        }
        if self.disabled {
            config.runtime.enabled = false;
        }
        if let Some(v) = self.activity_ring_bytes {
            config.activity_ring_bytes = v;
        }

        let tracing =
            self.trace_syscalls || self.trace_files || self.trace_network || self.trace_processes;
        if tracing || self.target_pid.is_some() {
            let mut monitor = match config.monitor {
                Some(monitor) => monitor,
                None if tracing => MonitorSettings {
                    syscalls: false,
                    ..Default::default()
                },
                None => MonitorSettings::default(),
            };
            monitor.syscalls |= self.trace_syscalls;
            monitor.files |= self.trace_files;
            monitor.network |= self.trace_network;
            monitor.process_lifecycle |= self.trace_processes;
            if let Some(pid) = self.target_pid {
                monitor.target_pid = pid;
            }
            config.monitor = Some(monitor);
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    let config = args
        .bridge_config()
        .context("Invalid configuration")?;

    info!("Starting IPS bridge...");
    info!(
        "   Duration: {} seconds",
        if args.duration == 0 {
            "infinite".to_string()
        } else {
            args.duration.to_string()
        }
    );
    info!("   Fail threshold: {}", config.runtime.fail_threshold);
    info!("   Window: {} seconds", config.runtime.window_secs);
    info!("   Monitor all connections: {}", config.runtime.monitor_all_connections);
    match &config.monitor {
        Some(m) => info!(
            "   Activity monitor: syscalls={} files={} network={} processes={} target_pid={}",
            m.syscalls, m.files, m.network, m.process_lifecycle, m.target_pid
        ),
        None => info!("   Activity monitor: off"),
    }
    info!("   Output format: {:?}", args.format);

    let bridge = Arc::new(KernelBridge::new(config));

    if let Err(e) = bridge.initialize() {
        if let Some(kind) = e.init_failure() {
            error!("eBPF probes unavailable: {}", kind);
            error!("   Hint: {}", kind.remediation());
        }
        return Err(e).context("Failed to initialize IPS bridge");
    }

    let by_kind: Arc<Mutex<BTreeMap<AlertKind, u64>>> = Arc::new(Mutex::new(BTreeMap::new()));
    let formatter = AlertFormatter::new(args.format);
    let counts = Arc::clone(&by_kind);
    bridge.set_event_callback(move |alert| {
        if let Ok(mut counts) = counts.lock() {
            *counts.entry(alert.kind).or_insert(0) += 1;
        }
        match formatter.format(alert, Utc::now()) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                if let Err(e) = writeln!(stdout, "{}", line) {
                    warn!("Failed to write alert: {}", e);
                }
            }
            Err(e) => warn!("Failed to format alert: {}", e),
        }
    });

    let activity_by_kind: Arc<Mutex<BTreeMap<ActivityKind, u64>>> =
        Arc::new(Mutex::new(BTreeMap::new()));
    let counts = Arc::clone(&activity_by_kind);
    bridge.set_activity_callback(move |activity| {
        if let Ok(mut counts) = counts.lock() {
            *counts.entry(activity.kind).or_insert(0) += 1;
        }
        match formatter.format_activity(activity, Utc::now()) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                if let Err(e) = writeln!(stdout, "{}", line) {
                    warn!("Failed to write activity record: {}", e);
                }
            }
            Err(e) => warn!("Failed to format activity record: {}", e),
        }
    });

    let mut poller = bridge.start().context("Failed to start poll loop")?;
    info!("Watching for SSH brute-force attempts...");

    if args.progress_interval > 0 {
        spawn_progress_reporter(Arc::clone(&bridge), args.progress_interval);
    }

    // Run for specified duration or until interrupted
    let start_time = Instant::now();
    let deadline = async {
        if args.duration > 0 {
            sleep(Duration::from_secs(args.duration)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    let finished = tokio::select! {
        _ = deadline => {
            info!("Duration reached, shutting down...");
            None
        }
        _ = signal::ctrl_c() => {
            info!("Interrupted, shutting down...");
            None
        }
        res = &mut poller => Some(res),
    };

    bridge.stop();
    let outcome = match finished {
        Some(res) => res,
        None => poller.await,
    };
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Poll loop ended with error: {}", e),
        Err(e) => error!("Poll task failed: {}", e),
    }

    let elapsed = start_time.elapsed().as_secs();
    let stats = bridge.get_stats().unwrap_or_else(|e| {
        warn!("Failed to read bridge statistics: {}", e);
        BridgeStats::default()
    });
    let processes = bridge.all_process_stats().unwrap_or_else(|e| {
        warn!("Failed to read process statistics: {}", e);
        Vec::new()
    });

    let monitored = bridge.monitored_processes().unwrap_or_else(|e| {
        warn!("Failed to read monitored processes: {}", e);
        Vec::new()
    });

    let by_kind = by_kind
        .lock()
        .map(|counts| counts.clone())
        .unwrap_or_default();
    let activity_by_kind = activity_by_kind
        .lock()
        .map(|counts| counts.clone())
        .unwrap_or_default();
    let summary = RunSummary::new(elapsed, bridge.runtime_config(), stats, &by_kind, processes)
        .with_activity(&activity_by_kind, monitored);

    if let Some(path) = &args.stats_output {
        JsonExporter::new(path.clone(), true).export(&summary)?;
        info!("Summary written to {:?}", path);
    }

    print_summary(&summary);
    bridge.shutdown();

    Ok(())
}

/// Periodically log alert and tracker counts
fn spawn_progress_reporter(bridge: Arc<KernelBridge>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs));
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match bridge.get_stats() {
                Ok(stats) => info!(
                    "📈 Progress: {} alerts, {} tracked sources, {} queued, {} activity records",
                    stats.total_events,
                    stats.tracked_sources,
                    stats.events_pending,
                    stats.activity_events
                ),
                Err(e) => {
                    warn!("Progress reporter stopping: {}", e);
                    return;
                }
            }
        }
    });
}

fn print_banner() {
    eprintln!(
        r#"
╔═══════════════════════════════════════════════════╗
║        eBPF IPS - SSH Brute-Force Probe           ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_summary(summary: &RunSummary) {
    for line in summary.report_lines() {
        info!("{}", line);
    }
}
