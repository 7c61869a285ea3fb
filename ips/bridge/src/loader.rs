//! eBPF program loader
//!
//! Loads the IPS object, sizes its maps, attaches the three SSH probes
//! and optionally the activity monitor, then serves as the control
//! handle for the loaded object: config writes, tracker counts, health
//! counters, per-process tables and detach.

use std::{fs, path::Path};

use aya::{
    maps::{Array, HashMap, MapData, RingBuf},
    programs::{KProbe, TracePoint},
    Bpf, BpfLoader,
};
use aya_log::BpfLogger;
use log::{debug, info, warn};
use probe_common::{
    constants::*,
    types::{IpTrack, IpsConfig, MonitorConfig, MonitoredProcess, ProcessStats},
};

use crate::{
    config::BridgeConfig,
    error::{BridgeError, InitFailure, Result},
    types::{KernelCounters, MonitoredProcessInfo, ProcessInfo},
};

/// Kernel functions instrumented by the object, as (program, function)
pub const PROBES: [(&str, &str); 3] = [
    ("tcp_v4_connect", "tcp_v4_connect"),
    ("tcp_v4_connect_ret", "tcp_v4_connect"),
    ("inet_csk_accept_ret", "inet_csk_accept"),
];

/// Activity monitor kprobes, as (program, function)
pub const ACTIVITY_KPROBES: [(&str, &str); 3] = [
    ("monitor_file_open", "do_filp_open"),
    ("monitor_tcp_sendmsg", "tcp_sendmsg"),
    ("monitor_tcp_recvmsg", "tcp_recvmsg"),
];

/// Activity monitor tracepoints, as (program, category, event)
pub const ACTIVITY_TRACEPOINTS: [(&str, &str, &str); 3] = [
    ("monitor_sys_enter", "raw_syscalls", "sys_enter"),
    ("monitor_process_fork", "sched", "sched_process_fork"),
    ("monitor_process_exit", "sched", "sched_process_exit"),
];

/// Control surface over a loaded probe set
///
/// Implemented by `ProbeLoader` for the real kernel object.
pub trait ProbeControl: Send {
    /// Overwrite the IPS_CONFIG entry
    fn write_config(&mut self, config: &IpsConfig) -> Result<()>;

    /// Number of source IPs currently in FAILED_LOGINS
    fn tracked_sources(&self) -> Result<usize>;

    fn kernel_counters(&self) -> Result<KernelCounters>;

    fn process_stats(&self, pid: u32) -> Result<Option<ProcessInfo>>;

    fn all_process_stats(&self) -> Result<Vec<ProcessInfo>>;

    /// Overwrite the MONITOR_CONFIG entry
    fn write_monitor_config(&mut self, config: &MonitorConfig) -> Result<()>;

    /// Identity and syscall count of a process seen by the activity monitor
    fn monitored_process(&self, pid: u32) -> Result<Option<MonitoredProcessInfo>>;

    fn monitored_processes(&self) -> Result<Vec<MonitoredProcessInfo>>;

    /// Detach every probe and release the object
    fn detach(&mut self);
}

/// eBPF program loader and manager
pub struct ProbeLoader {
    ebpf: Option<Bpf>,
    // Held so kernel-side log records keep being forwarded
    _logger: Option<BpfLogger>,
}

impl ProbeLoader {
    /// Load the eBPF object and size its maps
    ///
    /// Uses `config.ebpf_object` when set, the embedded object otherwise.
    pub fn load(config: &BridgeConfig) -> Result<Self> {
        info!("Loading eBPF program...");
        bump_memlock_rlimit();

        let mut loader = BpfLoader::new();
        loader
            .set_max_entries(MAP_ALERT_EVENTS, config.ring_buffer_bytes)
            .set_max_entries(MAP_FAILED_LOGINS, config.tracked_ip_capacity)
            .set_max_entries(MAP_ACTIVITY_EVENTS, config.activity_ring_bytes);

        let ebpf = match &config.ebpf_object {
            Some(path) => {
                let data = read_object(path)?;
                loader
                    .load(&data)
                    .map_err(|e| BridgeError::init("load", e, InitFailure::VerifierRejected))?
            }
            None => Self::load_embedded(&mut loader)?,
        };

        info!("eBPF program loaded successfully");

        Ok(Self {
            ebpf: Some(ebpf),
            _logger: None,
        })
    }

    #[cfg(feature = "embedded")]
    fn load_embedded(loader: &mut BpfLoader) -> Result<Bpf> {
        info!("Loading embedded eBPF program...");
        let data = aya::include_bytes_aligned!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../kernel/target/bpfel-unknown-none/release/ips-probe"
        ));
        loader
            .load(data)
            .map_err(|e| BridgeError::init("load embedded", e, InitFailure::VerifierRejected))
    }

    #[cfg(not(feature = "embedded"))]
    fn load_embedded(_loader: &mut BpfLoader) -> Result<Bpf> {
        Err(BridgeError::missing(
            "load",
            "no eBPF object file provided; use --ebpf-object or build with the 'embedded' feature",
        ))
    }

    /// Forward aya-log records from the probes
    ///
    /// Non-fatal if it fails.
    pub fn init_logger(&mut self) {
        let Some(ebpf) = self.ebpf.as_mut() else {
            return;
        };
        match BpfLogger::init(ebpf) {
            Ok(logger) => self._logger = Some(logger),
            Err(e) => warn!("eBPF logger unavailable, kernel-side logs will not be captured: {}", e),
        }
    }

    /// Load and attach every probe in `PROBES`
    pub fn attach_probes(&mut self) -> Result<()> {
        info!("Attaching kprobes for SSH connection tracking...");
        let ebpf = self.bpf_mut()?;

        for (name, function) in PROBES {
            attach_kprobe(ebpf, name, function)?;
            info!("  ✓ Attached {} to {}", name, function);
        }

        info!("All kprobes attached successfully");
        Ok(())
    }

    /// Load and attach the activity monitor programs
    ///
    /// Each one is optional: a kernel without the traced function or
    /// tracepoint costs that family only. Fails only when none attach.
    pub fn attach_activity_probes(&mut self) -> Result<usize> {
        info!("Attaching activity monitor programs...");
        let ebpf = self.bpf_mut()?;
        let mut attached = 0;

        for (name, function) in ACTIVITY_KPROBES {
            match attach_kprobe(ebpf, name, function) {
                Ok(()) => {
                    info!("  ✓ Attached {} to {}", name, function);
                    attached += 1;
                }
                Err(e) => warn!("  ⚠ {} not attached: {}", name, e),
            }
        }

        for (name, category, event) in ACTIVITY_TRACEPOINTS {
            match attach_tracepoint(ebpf, name, category, event) {
                Ok(()) => {
                    info!("  ✓ Attached {} to {}:{}", name, category, event);
                    attached += 1;
                }
                Err(e) => warn!("  ⚠ {} not attached: {}", name, e),
            }
        }

        if attached == 0 {
            return Err(BridgeError::missing(
                "attach activity monitor",
                "no activity program could be attached",
            ));
        }
        info!(
            "{} of {} activity programs attached",
            attached,
            ACTIVITY_KPROBES.len() + ACTIVITY_TRACEPOINTS.len()
        );
        Ok(attached)
    }

    /// Take ownership of the ALERT_EVENTS ring buffer
    pub fn take_ring_buffer(&mut self) -> Result<RingBuf<MapData>> {
        self.take_ring(MAP_ALERT_EVENTS)
    }

    /// Take ownership of the ACTIVITY_EVENTS ring buffer
    pub fn take_activity_ring(&mut self) -> Result<RingBuf<MapData>> {
        self.take_ring(MAP_ACTIVITY_EVENTS)
    }

    fn take_ring(&mut self, name: &'static str) -> Result<RingBuf<MapData>> {
        let map = self.bpf_mut()?.take_map(name).ok_or_else(|| {
            BridgeError::missing(format!("map {}", name), "map not found in eBPF object")
        })?;

        RingBuf::try_from(map).map_err(|e| {
            BridgeError::init(format!("map {}", name), e, InitFailure::UnsupportedKernel)
        })
    }

    fn bpf(&self) -> Result<&Bpf> {
        self.ebpf.as_ref().ok_or_else(detached)
    }

    fn bpf_mut(&mut self) -> Result<&mut Bpf> {
        self.ebpf.as_mut().ok_or_else(detached)
    }

    fn map_err(map: &'static str) -> impl Fn(aya::maps::MapError) -> BridgeError {
        move |e| BridgeError::Map {
            map,
            detail: e.to_string(),
        }
    }

    fn syscall_counts(ebpf: &Bpf) -> Result<HashMap<&MapData, u32, u64>> {
        let map = ebpf
            .map(MAP_SYSCALL_COUNTS)
            .ok_or_else(|| Self::missing_map(MAP_SYSCALL_COUNTS))?;
        HashMap::try_from(map).map_err(Self::map_err(MAP_SYSCALL_COUNTS))
    }

    fn missing_map(map: &'static str) -> BridgeError {
        BridgeError::Map {
            map,
            detail: "map not found in eBPF object".to_string(),
        }
    }
}

impl ProbeControl for ProbeLoader {
    fn write_config(&mut self, config: &IpsConfig) -> Result<()> {
        let map = self
            .bpf_mut()?
            .map_mut(MAP_IPS_CONFIG)
            .ok_or_else(|| Self::missing_map(MAP_IPS_CONFIG))?;
        let mut array: Array<_, IpsConfig> =
            Array::try_from(map).map_err(Self::map_err(MAP_IPS_CONFIG))?;

        array
            .set(CONFIG_INDEX, *config, 0)
            .map_err(Self::map_err(MAP_IPS_CONFIG))?;

        debug!(
            "IPS_CONFIG written: enabled={} threshold={} window_ns={} monitor_all={}",
            config.enabled, config.fail_threshold, config.window_ns, config.monitor_all_connections
        );
        Ok(())
    }

    fn tracked_sources(&self) -> Result<usize> {
        let map = self
            .bpf()?
            .map(MAP_FAILED_LOGINS)
            .ok_or_else(|| Self::missing_map(MAP_FAILED_LOGINS))?;
        let table: HashMap<_, u32, IpTrack> =
            HashMap::try_from(map).map_err(Self::map_err(MAP_FAILED_LOGINS))?;

        // Keys can vanish under us through LRU eviction; skip those
        Ok(table.keys().filter(|k| k.is_ok()).count())
    }

    fn kernel_counters(&self) -> Result<KernelCounters> {
        let map = self
            .bpf()?
            .map(MAP_PROBE_STATS)
            .ok_or_else(|| Self::missing_map(MAP_PROBE_STATS))?;
        let stats: HashMap<_, u32, u64> =
            HashMap::try_from(map).map_err(Self::map_err(MAP_PROBE_STATS))?;

        Ok(KernelCounters::from_lookup(|id| stats.get(&id, 0).unwrap_or(0)))
    }

    fn process_stats(&self, pid: u32) -> Result<Option<ProcessInfo>> {
        let map = self
            .bpf()?
            .map(MAP_PROCESS_STATS)
            .ok_or_else(|| Self::missing_map(MAP_PROCESS_STATS))?;
        let table: HashMap<_, u32, ProcessStats> =
            HashMap::try_from(map).map_err(Self::map_err(MAP_PROCESS_STATS))?;

        match table.get(&pid, 0) {
            Ok(stats) => Ok(Some(ProcessInfo::from(stats))),
            Err(aya::maps::MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(Self::map_err(MAP_PROCESS_STATS)(e)),
        }
    }

    fn all_process_stats(&self) -> Result<Vec<ProcessInfo>> {
        let map = self
            .bpf()?
            .map(MAP_PROCESS_STATS)
            .ok_or_else(|| Self::missing_map(MAP_PROCESS_STATS))?;
        let table: HashMap<_, u32, ProcessStats> =
            HashMap::try_from(map).map_err(Self::map_err(MAP_PROCESS_STATS))?;

        let mut out: Vec<ProcessInfo> = table
            .iter()
            .filter_map(|entry| entry.ok())
            .map(|(_, stats)| ProcessInfo::from(stats))
            .collect();
        out.sort_by_key(|p| p.pid);
        Ok(out)
    }

    fn write_monitor_config(&mut self, config: &MonitorConfig) -> Result<()> {
        let map = self
            .bpf_mut()?
            .map_mut(MAP_MONITOR_CONFIG)
            .ok_or_else(|| Self::missing_map(MAP_MONITOR_CONFIG))?;
        let mut array: Array<_, MonitorConfig> =
            Array::try_from(map).map_err(Self::map_err(MAP_MONITOR_CONFIG))?;

        array
            .set(CONFIG_INDEX, *config, 0)
            .map_err(Self::map_err(MAP_MONITOR_CONFIG))?;

        debug!(
            "MONITOR_CONFIG written: syscalls={} files={} network={} lifecycle={} target_pid={}",
            config.syscalls, config.files, config.network, config.process_lifecycle, config.target_pid
        );
        Ok(())
    }

    fn monitored_process(&self, pid: u32) -> Result<Option<MonitoredProcessInfo>> {
        let ebpf = self.bpf()?;
        let map = ebpf
            .map(MAP_MONITORED_PROCESSES)
            .ok_or_else(|| Self::missing_map(MAP_MONITORED_PROCESSES))?;
        let table: HashMap<_, u32, MonitoredProcess> =
            HashMap::try_from(map).map_err(Self::map_err(MAP_MONITORED_PROCESSES))?;

        let process = match table.get(&pid, 0) {
            Ok(process) => process,
            Err(aya::maps::MapError::KeyNotFound) => return Ok(None),
            Err(e) => return Err(Self::map_err(MAP_MONITORED_PROCESSES)(e)),
        };
        let counts = Self::syscall_counts(ebpf)?;
        Ok(Some(MonitoredProcessInfo::new(
            process,
            counts.get(&pid, 0).unwrap_or(0),
        )))
    }

    fn monitored_processes(&self) -> Result<Vec<MonitoredProcessInfo>> {
        let ebpf = self.bpf()?;
        let map = ebpf
            .map(MAP_MONITORED_PROCESSES)
            .ok_or_else(|| Self::missing_map(MAP_MONITORED_PROCESSES))?;
        let table: HashMap<_, u32, MonitoredProcess> =
            HashMap::try_from(map).map_err(Self::map_err(MAP_MONITORED_PROCESSES))?;
        let counts = Self::syscall_counts(ebpf)?;

        // Entries can vanish under us through exit cleanup or LRU eviction
        let mut out: Vec<MonitoredProcessInfo> = table
            .iter()
            .filter_map(|entry| entry.ok())
            .map(|(pid, process)| {
                MonitoredProcessInfo::new(process, counts.get(&pid, 0).unwrap_or(0))
            })
            .collect();
        out.sort_by_key(|p| p.pid);
        Ok(out)
    }

    fn detach(&mut self) {
        if self.ebpf.take().is_some() {
            self._logger = None;
            info!("eBPF programs detached");
        }
    }
}

fn attach_kprobe(ebpf: &mut Bpf, name: &str, function: &str) -> Result<()> {
    let program: &mut KProbe = ebpf
        .program_mut(name)
        .ok_or_else(|| {
            BridgeError::missing(format!("attach {}", name), "program not found in eBPF object")
        })?
        .try_into()
        .map_err(|e| BridgeError::init(format!("attach {}", name), e, InitFailure::ObjectMissing))?;

    program.load().map_err(|e| {
        BridgeError::init(format!("load {}", name), e, InitFailure::VerifierRejected)
    })?;
    program.attach(function, 0).map_err(|e| {
        BridgeError::init(format!("attach {}", name), e, InitFailure::UnsupportedKernel)
    })?;
    Ok(())
}

fn attach_tracepoint(ebpf: &mut Bpf, name: &str, category: &str, event: &str) -> Result<()> {
    let program: &mut TracePoint = ebpf
        .program_mut(name)
        .ok_or_else(|| {
            BridgeError::missing(format!("attach {}", name), "program not found in eBPF object")
        })?
        .try_into()
        .map_err(|e| BridgeError::init(format!("attach {}", name), e, InitFailure::ObjectMissing))?;

    program.load().map_err(|e| {
        BridgeError::init(format!("load {}", name), e, InitFailure::VerifierRejected)
    })?;
    program.attach(category, event).map_err(|e| {
        BridgeError::init(format!("attach {}", name), e, InitFailure::UnsupportedKernel)
    })?;
    Ok(())
}

fn detached() -> BridgeError {
    BridgeError::Map {
        map: "*",
        detail: "probes are detached".to_string(),
    }
}

fn read_object(path: &Path) -> Result<Vec<u8>> {
    info!("Loading eBPF object from: {:?}", path);
    fs::read(path).map_err(|e| BridgeError::Init {
        kind: InitFailure::ObjectMissing,
        stage: "read object".to_string(),
        detail: format!("{}: {}", path.display(), e),
    })
}

/// Remove the locked memory limit (needed before 5.11 memcg accounting)
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: setrlimit only reads the struct we pass
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to remove limit on locked memory (ret={})", ret);
    }
}
