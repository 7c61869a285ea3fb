//! Userspace bridge
//!
//! Owns the loaded probes and the record sources, runs the poll loop and
//! fans decoded records out through two `EventBus`es: one for alerts,
//! one for activity monitor records when the monitor is installed.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized --initialize--> Initialized --start/run--> Running
//!                                    |                        |
//!                                    +------stop------> Stopped <-+
//!                                                          |
//!                                      start/run (restart) +--> Running
//! ```
//!
//! `shutdown` detaches everything and returns to `Uninitialized` from
//! any state. `stop` only touches atomics, so it may be called from any
//! thread or from a signal handler.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::{
    bus::{ActivityCallback, AlertCallback, EventBus},
    config::{BridgeConfig, ConfigUpdate, MonitorSettings, MonitorUpdate, RuntimeConfig},
    error::{BridgeError, Result},
    events::{RecordSource, RingBufSource},
    loader::{ProbeControl, ProbeLoader},
    types::{Activity, Alert, BridgeStats, KernelCounters, MonitoredProcessInfo, ProcessInfo},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BridgeState {
    Uninitialized = 0,
    Initialized = 1,
    Running = 2,
    Stopped = 3,
}

impl BridgeState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BridgeState::Initialized,
            2 => BridgeState::Running,
            3 => BridgeState::Stopped,
            _ => BridgeState::Uninitialized,
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BridgeState::Uninitialized => "uninitialized",
            BridgeState::Initialized => "initialized",
            BridgeState::Running => "running",
            BridgeState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Which source a polled batch came from
enum Stream {
    Alerts,
    Activity,
}

/// Bridge over the real kernel probes
pub type KernelBridge = Bridge<RingBufSource, ProbeLoader>;

pub struct Bridge<S: RecordSource, C: ProbeControl> {
    config: BridgeConfig,
    runtime: Mutex<RuntimeConfig>,
    monitor: Mutex<Option<MonitorSettings>>,
    state: AtomicU8,
    stop_requested: AtomicBool,
    // Lock order: source, then activity_source
    source: Mutex<Option<S>>,
    activity_source: Mutex<Option<S>>,
    control: Mutex<Option<C>>,
    bus: EventBus<Alert>,
    activity: EventBus<Activity>,
    decode_errors: AtomicU64,
}

impl<S: RecordSource, C: ProbeControl> Bridge<S, C> {
    /// Create an uninitialized bridge
    pub fn new(config: BridgeConfig) -> Self {
        let bus = EventBus::new(config.queue_capacity);
        let activity = EventBus::new(config.queue_capacity);
        Self {
            runtime: Mutex::new(config.runtime),
            monitor: Mutex::new(None),
            config,
            state: AtomicU8::new(BridgeState::Uninitialized as u8),
            stop_requested: AtomicBool::new(false),
            source: Mutex::new(None),
            activity_source: Mutex::new(None),
            control: Mutex::new(None),
            bus,
            activity,
            decode_errors: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BridgeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Hand an attached source and control to the bridge
    ///
    /// Pushes the initial runtime configuration into the kernel. On
    /// failure the bridge stays `Uninitialized` and both are dropped.
    pub fn install(&self, source: S, mut control: C) -> Result<()> {
        let state = self.state();
        if state != BridgeState::Uninitialized {
            return Err(BridgeError::InvalidState {
                operation: "initialize",
                state,
            });
        }

        let runtime = *lock(&self.runtime);
        control.write_config(&runtime.to_kernel())?;

        *lock(&self.source) = Some(source);
        *lock(&self.control) = Some(control);
        self.stop_requested.store(false, Ordering::SeqCst);
        self.set_state(BridgeState::Initialized);

        info!(
            "Bridge initialized: threshold={} window={}s monitor_all={} enabled={}",
            runtime.fail_threshold,
            runtime.window_secs,
            runtime.monitor_all_connections,
            runtime.enabled
        );
        Ok(())
    }

    /// Add the activity monitor's record source and switch it on
    ///
    /// Valid once initialized and while not running; the next `start`
    /// polls it alongside the alert source.
    pub fn install_activity(&self, source: S, settings: MonitorSettings) -> Result<()> {
        let state = self.state();
        if !matches!(state, BridgeState::Initialized | BridgeState::Stopped) {
            return Err(BridgeError::InvalidState {
                operation: "install_activity",
                state,
            });
        }

        let mut control = lock(&self.control);
        let Some(control) = control.as_mut() else {
            return Err(BridgeError::InvalidState {
                operation: "install_activity",
                state,
            });
        };
        control.write_monitor_config(&settings.to_kernel())?;

        *lock(&self.activity_source) = Some(source);
        *lock(&self.monitor) = Some(settings);

        info!(
            "Activity monitor installed: syscalls={} files={} network={} lifecycle={} target_pid={}",
            settings.syscalls,
            settings.files,
            settings.network,
            settings.process_lifecycle,
            settings.target_pid
        );
        Ok(())
    }

    /// Move to `Running` and take the sources for the poll loop
    fn begin_run(&self) -> Result<(S, Option<S>)> {
        loop {
            let state = self.state();
            if !matches!(state, BridgeState::Initialized | BridgeState::Stopped) {
                return Err(BridgeError::InvalidState {
                    operation: "start",
                    state,
                });
            }

            let mut slot = lock(&self.source);
            let Some(source) = slot.take() else {
                return Err(BridgeError::InvalidState {
                    operation: "start",
                    state,
                });
            };

            let mut activity = lock(&self.activity_source);
            self.stop_requested.store(false, Ordering::SeqCst);
            match self.state.compare_exchange(
                state as u8,
                BridgeState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if state == BridgeState::Stopped {
                        info!("Bridge restarting");
                    }
                    return Ok((source, activity.take()));
                }
                // Raced with stop(); retry from the new state
                Err(_) => *slot = Some(source),
            }
        }
    }

    /// Run the poll loop until `stop` or a poll error
    ///
    /// Valid from `Initialized`, or from `Stopped` to restart.
    pub async fn run(&self) -> Result<()> {
        let (source, activity) = self.begin_run()?;
        self.poll_loop(source, activity).await
    }

    async fn poll_loop(&self, mut source: S, mut activity: Option<S>) -> Result<()> {
        let interval = self.config.poll_interval();
        info!(
            "Poll loop started (interval {:?}, activity monitor {})",
            interval,
            if activity.is_some() { "on" } else { "off" }
        );

        let mut outcome = Ok(());
        while !self.stop_requested.load(Ordering::SeqCst) {
            // Both polls are bounded by the interval; whichever has
            // records first wins and the other is retried next round
            let polled = match activity.as_mut() {
                Some(activity) => tokio::select! {
                    res = source.poll(interval) => res.map(|records| (Stream::Alerts, records)),
                    res = activity.poll(interval) => res.map(|records| (Stream::Activity, records)),
                },
                None => source
                    .poll(interval)
                    .await
                    .map(|records| (Stream::Alerts, records)),
            };

            match polled {
                Ok((Stream::Alerts, records)) => {
                    for record in records {
                        self.dispatch(&record);
                    }
                }
                Ok((Stream::Activity, records)) => {
                    for record in records {
                        self.dispatch_activity(&record);
                    }
                }
                Err(e) => {
                    error!("Ring buffer poll failed, stopping: {}", e);
                    outcome = Err(e);
                    break;
                }
            }
        }

        // Serialized against shutdown so a detached bridge never gets
        // its sources back
        let mut slot = lock(&self.source);
        let mut activity_slot = lock(&self.activity_source);
        if self
            .state
            .compare_exchange(
                BridgeState::Running as u8,
                BridgeState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            *slot = Some(source);
            *activity_slot = activity;
        }
        drop(activity_slot);
        drop(slot);

        info!("Poll loop stopped");
        outcome
    }

    fn dispatch(&self, record: &[u8]) {
        match Alert::decode(record) {
            Ok(alert) => {
                debug!("Alert: {}", alert);
                self.bus.publish(alert);
            }
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping ring buffer record: {}", e);
            }
        }
    }

    fn dispatch_activity(&self, record: &[u8]) {
        match Activity::decode(record) {
            Ok(activity) => self.activity.publish(activity),
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping activity record: {}", e);
            }
        }
    }

    /// Ask the poll loop to exit at its next timeout boundary
    ///
    /// Idempotent. Before `start` it moves the bridge straight to
    /// `Stopped`.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let _ = self.state.compare_exchange(
            BridgeState::Initialized as u8,
            BridgeState::Stopped as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Register the per-alert callback, replacing any previous one
    ///
    /// The callback runs on the poll task; it should hand heavy work off
    /// rather than block.
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        let callback: AlertCallback = Arc::new(callback);
        self.bus.set_callback(Some(callback));
    }

    /// Take up to `max` queued alerts, oldest first, without blocking
    pub fn drain_events(&self, max: usize) -> Vec<Alert> {
        self.bus.drain(max)
    }

    /// Register the per-record callback of the activity monitor
    pub fn set_activity_callback<F>(&self, callback: F)
    where
        F: Fn(&Activity) + Send + Sync + 'static,
    {
        let callback: ActivityCallback = Arc::new(callback);
        self.activity.set_callback(Some(callback));
    }

    /// Take up to `max` queued activity records, oldest first
    pub fn drain_activity(&self, max: usize) -> Vec<Activity> {
        self.activity.drain(max)
    }

    /// Write changed runtime fields into the kernel
    ///
    /// Takes effect on the next probe invocation. Returns the
    /// configuration now in force.
    pub fn update_config(&self, update: ConfigUpdate) -> Result<RuntimeConfig> {
        let mut control = lock(&self.control);
        let Some(control) = control.as_mut() else {
            return Err(BridgeError::InvalidState {
                operation: "update_config",
                state: self.state(),
            });
        };

        let mut runtime = lock(&self.runtime);
        let next = update.apply(*runtime);
        control.write_config(&next.to_kernel())?;
        *runtime = next;

        info!(
            "Runtime config updated: threshold={} window={}s monitor_all={} enabled={}",
            next.fail_threshold, next.window_secs, next.monitor_all_connections, next.enabled
        );
        Ok(next)
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        *lock(&self.runtime)
    }

    /// Write changed activity monitor switches into the kernel
    ///
    /// Requires an installed activity monitor.
    pub fn update_monitor(&self, update: MonitorUpdate) -> Result<MonitorSettings> {
        let mut control = lock(&self.control);
        let mut monitor = lock(&self.monitor);
        let (Some(control), Some(current)) = (control.as_mut(), monitor.as_mut()) else {
            return Err(BridgeError::InvalidState {
                operation: "update_monitor",
                state: self.state(),
            });
        };

        let next = update.apply(*current);
        control.write_monitor_config(&next.to_kernel())?;
        *current = next;

        info!(
            "Activity monitor updated: syscalls={} files={} network={} lifecycle={} target_pid={}",
            next.syscalls, next.files, next.network, next.process_lifecycle, next.target_pid
        );
        Ok(next)
    }

    /// Switches in force, None while the activity monitor is not installed
    pub fn monitor_settings(&self) -> Option<MonitorSettings> {
        *lock(&self.monitor)
    }

    pub fn get_stats(&self) -> Result<BridgeStats> {
        let (tracked_sources, kernel) = match lock(&self.control).as_ref() {
            Some(control) => (control.tracked_sources()?, control.kernel_counters()?),
            None => (0, KernelCounters::default()),
        };

        Ok(BridgeStats {
            tracked_sources,
            events_pending: self.bus.pending(),
            total_events: self.bus.total(),
            queue_overflows: self.bus.overflows(),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            activity_events: self.activity.total(),
            activity_pending: self.activity.pending(),
            activity_overflows: self.activity.overflows(),
            kernel,
        })
    }

    /// Connection counters recorded for `pid`, if the kernel has any
    pub fn process_stats(&self, pid: u32) -> Result<Option<ProcessInfo>> {
        match lock(&self.control).as_ref() {
            Some(control) => control.process_stats(pid),
            None => Ok(None),
        }
    }

    pub fn all_process_stats(&self) -> Result<Vec<ProcessInfo>> {
        match lock(&self.control).as_ref() {
            Some(control) => control.all_process_stats(),
            None => Ok(Vec::new()),
        }
    }

    /// Identity and syscall count of a process the activity monitor saw
    pub fn monitored_process(&self, pid: u32) -> Result<Option<MonitoredProcessInfo>> {
        match lock(&self.control).as_ref() {
            Some(control) => control.monitored_process(pid),
            None => Ok(None),
        }
    }

    pub fn monitored_processes(&self) -> Result<Vec<MonitoredProcessInfo>> {
        match lock(&self.control).as_ref() {
            Some(control) => control.monitored_processes(),
            None => Ok(Vec::new()),
        }
    }

    /// Detach the probes and release the sources
    ///
    /// A no-op on a bridge that was never initialized. A running poll
    /// loop exits at its next timeout and drops its source.
    pub fn shutdown(&self) {
        self.stop();

        let control = lock(&self.control).take();
        let mut source = lock(&self.source);
        let mut activity = lock(&self.activity_source);
        let was = self.state();
        self.set_state(BridgeState::Uninitialized);
        let sources = (source.take(), activity.take());
        *lock(&self.monitor) = None;

        if let Some(mut control) = control {
            control.detach();
            info!("Bridge shut down (was {})", was);
        }
        drop(activity);
        drop(source);
        drop(sources);
    }
}

impl<S, C> Bridge<S, C>
where
    S: RecordSource + 'static,
    C: ProbeControl + 'static,
{
    /// Spawn the poll loop on the tokio runtime
    ///
    /// The state change happens before this returns, so a `start`
    /// immediately followed by `stop` is never lost.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        let (source, activity) = self.begin_run()?;
        let bridge = Arc::clone(self);
        Ok(tokio::spawn(async move {
            bridge.poll_loop(source, activity).await
        }))
    }
}

impl KernelBridge {
    /// Load and attach the kernel probes, then install them
    ///
    /// The activity monitor is attached too when the configuration asks
    /// for it. Must be called from within a tokio runtime. On failure the
    /// bridge stays `Uninitialized` and the error says why.
    pub fn initialize(&self) -> Result<()> {
        let state = self.state();
        if state != BridgeState::Uninitialized {
            return Err(BridgeError::InvalidState {
                operation: "initialize",
                state,
            });
        }
        self.config.validate()?;

        let mut loader = ProbeLoader::load(&self.config)?;
        loader.init_logger();
        loader.attach_probes()?;

        let ring = loader.take_ring_buffer()?;
        let source = RingBufSource::new(ring)?;

        let activity = match self.config.monitor {
            Some(settings) => {
                loader.attach_activity_probes()?;
                let ring = loader.take_activity_ring()?;
                Some((RingBufSource::new(ring)?, settings))
            }
            None => None,
        };

        self.install(source, loader)?;
        if let Some((source, settings)) = activity {
            if let Err(e) = self.install_activity(source, settings) {
                self.shutdown();
                return Err(e);
            }
        }
        Ok(())
    }
}

impl<S: RecordSource, C: ProbeControl> Drop for Bridge<S, C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tracker::WindowTracker, types::AlertKind};
    use bytes::Bytes;
    use crate::types::{ActivityEvent, ActivityKind};
    use probe_common::{
        constants::*,
        types::{IpsConfig, MonitorConfig},
        window::Verdict,
        AlertEvent,
    };
    use std::{
        net::Ipv4Addr,
        sync::atomic::AtomicUsize,
        time::Duration,
    };
    use tokio::sync::mpsc;

    /// Records fed by the test through a channel
    struct MockSource {
        rx: mpsc::UnboundedReceiver<Result<Vec<Bytes>>>,
    }

    impl RecordSource for MockSource {
        async fn poll(&mut self, timeout: Duration) -> Result<Vec<Bytes>> {
            match tokio::time::timeout(timeout, self.rx.recv()).await {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    tokio::time::sleep(timeout).await;
                    Ok(Vec::new())
                }
                Err(_) => Ok(Vec::new()),
            }
        }
    }

    #[derive(Clone, Default)]
    struct MockControl {
        writes: Arc<Mutex<Vec<IpsConfig>>>,
        monitor_writes: Arc<Mutex<Vec<MonitorConfig>>>,
        tracked: Arc<AtomicUsize>,
        detached: Arc<AtomicBool>,
        fail_writes: bool,
    }

    impl ProbeControl for MockControl {
        fn write_config(&mut self, config: &IpsConfig) -> Result<()> {
            if self.fail_writes {
                return Err(BridgeError::Map {
                    map: MAP_IPS_CONFIG,
                    detail: "update failed".to_string(),
                });
            }
            self.writes.lock().unwrap().push(*config);
            Ok(())
        }

        fn tracked_sources(&self) -> Result<usize> {
            Ok(self.tracked.load(Ordering::Relaxed))
        }

        fn kernel_counters(&self) -> Result<KernelCounters> {
            Ok(KernelCounters {
                accepts_seen: 7,
                ..Default::default()
            })
        }

        fn process_stats(&self, pid: u32) -> Result<Option<ProcessInfo>> {
            Ok((pid == 1).then(|| ProcessInfo {
                pid,
                comm: "sshd".to_string(),
                first_seen_ns: 0,
                connect_count: 0,
                accept_count: 3,
            }))
        }

        fn all_process_stats(&self) -> Result<Vec<ProcessInfo>> {
            Ok(self.process_stats(1)?.into_iter().collect())
        }

        fn write_monitor_config(&mut self, config: &MonitorConfig) -> Result<()> {
            self.monitor_writes.lock().unwrap().push(*config);
            Ok(())
        }

        fn monitored_process(&self, pid: u32) -> Result<Option<MonitoredProcessInfo>> {
            Ok((pid == 300).then(|| MonitoredProcessInfo {
                pid,
                ppid: 1,
                uid: 1000,
                gid: 1000,
                comm: "cat".to_string(),
                start_time_ns: 5,
                syscall_count: 12,
            }))
        }

        fn monitored_processes(&self) -> Result<Vec<MonitoredProcessInfo>> {
            Ok(self.monitored_process(300)?.into_iter().collect())
        }

        fn detach(&mut self) {
            self.detached.store(true, Ordering::SeqCst);
        }
    }

    type TestBridge = Bridge<MockSource, MockControl>;

    fn test_config(queue_capacity: usize) -> BridgeConfig {
        BridgeConfig {
            queue_capacity,
            poll_interval_ms: 10,
            ..Default::default()
        }
    }

    fn installed(
        queue_capacity: usize,
    ) -> (
        Arc<TestBridge>,
        mpsc::UnboundedSender<Result<Vec<Bytes>>>,
        MockControl,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let control = MockControl::default();
        let bridge = Arc::new(TestBridge::new(test_config(queue_capacity)));
        bridge
            .install(MockSource { rx }, control.clone())
            .unwrap();
        (bridge, tx, control)
    }

    fn record(verdict: &Verdict, ip: Ipv4Addr) -> Bytes {
        let mut event = AlertEvent::zeroed();
        event.source_ip = u32::from(ip).to_be();
        event.dest_port = SSH_PORT;
        event.fail_count = verdict.fail_count;
        event.first_seen = verdict.first_seen;
        event.last_seen = verdict.last_seen;
        event.alert_kind = verdict.alert_kind;
        event.process_name = *b"sshd\0\0\0\0\0\0\0\0\0\0\0\0";
        // SAFETY: AlertEvent is Pod
        let bytes: [u8; AlertEvent::SIZE] = unsafe { std::mem::transmute(event) };
        Bytes::copy_from_slice(&bytes)
    }

    /// What the accept probe would emit for `count` accepts from `ip`
    fn accept_burst(ip: Ipv4Addr, count: u64, threshold: u32) -> Vec<Bytes> {
        let mut config = IpsConfig::zeroed();
        config.enabled = 1;
        config.fail_threshold = threshold;
        let mut tracker = WindowTracker::new(16, config);
        (0..count)
            .map(|s| record(&tracker.observe(ip, s * 1_000_000_000), ip))
            .collect()
    }

    fn activity_record(kind: u32, pid: u32) -> Bytes {
        let mut event = ActivityEvent::zeroed();
        event.kind = kind;
        event.pid = pid;
        event.syscall_nr = if kind == ACTIVITY_SYSCALL { 257 } else { -1 };
        // SAFETY: ActivityEvent is Pod
        let bytes: [u8; ActivityEvent::SIZE] = unsafe { std::mem::transmute(event) };
        Bytes::copy_from_slice(&bytes)
    }

    /// Installed bridge with the activity monitor on, and its feed
    fn with_activity(
        bridge: &TestBridge,
        settings: MonitorSettings,
    ) -> mpsc::UnboundedSender<Result<Vec<Bytes>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        bridge.install_activity(MockSource { rx }, settings).unwrap();
        tx
    }

    async fn wait_for_activity(bridge: &TestBridge, n: usize) {
        for _ in 0..200 {
            if bridge.get_stats().unwrap().activity_pending >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {} activity records", n);
    }

    async fn wait_for_pending(bridge: &TestBridge, n: usize) {
        for _ in 0..200 {
            if bridge.get_stats().unwrap().events_pending >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {} events", n);
    }

    #[test]
    fn test_install_writes_initial_config() {
        let (bridge, _tx, control) = installed(10);
        assert_eq!(bridge.state(), BridgeState::Initialized);

        let writes = control.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], RuntimeConfig::default().to_kernel());
    }

    #[test]
    fn test_failed_install_stays_uninitialized() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let control = MockControl {
            fail_writes: true,
            ..Default::default()
        };
        let bridge = TestBridge::new(test_config(10));

        let err = bridge.install(MockSource { rx }, control).unwrap_err();
        assert!(matches!(err, BridgeError::Map { .. }));
        assert_eq!(bridge.state(), BridgeState::Uninitialized);
    }

    #[test]
    fn test_start_requires_initialization() {
        let bridge = TestBridge::new(test_config(10));
        let rt = tokio::runtime::Runtime::new().unwrap();
        let err = rt.block_on(bridge.run()).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidState {
                state: BridgeState::Uninitialized,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_start_stop_restart() {
        let (bridge, tx, _control) = installed(100);

        let handle = bridge.start().unwrap();
        assert_eq!(bridge.state(), BridgeState::Running);
        assert!(bridge.start().is_err());

        tx.send(Ok(accept_burst(Ipv4Addr::new(10, 0, 0, 9), 3, 5))).unwrap();
        wait_for_pending(&bridge, 3).await;

        bridge.stop();
        handle.await.unwrap().unwrap();
        assert_eq!(bridge.state(), BridgeState::Stopped);

        // Restart picks up where the source left off
        let handle = bridge.start().unwrap();
        tx.send(Ok(accept_burst(Ipv4Addr::new(10, 0, 0, 10), 1, 5))).unwrap();
        wait_for_pending(&bridge, 4).await;
        bridge.stop();
        handle.await.unwrap().unwrap();

        let stats = bridge.get_stats().unwrap();
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.kernel.accepts_seen, 7);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_allowed_before_start() {
        let (bridge, _tx, control) = installed(10);

        bridge.stop();
        bridge.stop();
        assert_eq!(bridge.state(), BridgeState::Stopped);

        bridge.shutdown();
        bridge.stop();
        assert_eq!(bridge.state(), BridgeState::Uninitialized);
        assert!(control.detached.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shutdown_without_initialize_is_noop() {
        let bridge = TestBridge::new(test_config(10));
        bridge.shutdown();
        bridge.shutdown();
        assert_eq!(bridge.state(), BridgeState::Uninitialized);
        assert_eq!(bridge.get_stats().unwrap(), BridgeStats::default());
    }

    #[tokio::test]
    async fn test_threshold_burst_reaches_consumers_in_order() {
        let (bridge, tx, _control) = installed(100);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bridge.set_event_callback(move |alert| {
            sink.lock().unwrap().push((alert.kind, alert.fail_count));
        });

        let handle = bridge.start().unwrap();
        tx.send(Ok(accept_burst(Ipv4Addr::new(10, 0, 0, 9), 6, 5))).unwrap();
        wait_for_pending(&bridge, 6).await;
        bridge.stop();
        handle.await.unwrap().unwrap();

        let expected = vec![
            (AlertKind::SshAttempt, 0),
            (AlertKind::SshAuthFail, 1),
            (AlertKind::SshAuthFail, 2),
            (AlertKind::SshAuthFail, 3),
            (AlertKind::SshAuthFail, 4),
            (AlertKind::BruteForceThreshold, 5),
        ];
        assert_eq!(*seen.lock().unwrap(), expected);

        let drained: Vec<_> = bridge
            .drain_events(100)
            .iter()
            .map(|a| (a.kind, a.fail_count))
            .collect();
        assert_eq!(drained, expected);

        assert!(bridge.drain_events(1).is_empty());
    }

    #[tokio::test]
    async fn test_queue_keeps_most_recent_events() {
        let capacity = 4;
        let (bridge, tx, _control) = installed(capacity);

        let handle = bridge.start().unwrap();
        tx.send(Ok(accept_burst(Ipv4Addr::new(192, 0, 2, 1), 10, 100))).unwrap();

        for _ in 0..200 {
            if bridge.get_stats().unwrap().total_events >= 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        bridge.stop();
        handle.await.unwrap().unwrap();

        let stats = bridge.get_stats().unwrap();
        assert_eq!(stats.events_pending, capacity);
        assert_eq!(stats.queue_overflows, 6);

        let counts: Vec<u32> = bridge
            .drain_events(capacity)
            .iter()
            .map(|a| a.fail_count)
            .collect();
        assert_eq!(counts, vec![6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_malformed_records_are_counted_and_skipped() {
        let (bridge, tx, _control) = installed(10);
        let handle = bridge.start().unwrap();

        let mut batch = vec![Bytes::from_static(&[0u8; 10])];
        batch.extend(accept_burst(Ipv4Addr::new(10, 1, 1, 1), 1, 5));
        tx.send(Ok(batch)).unwrap();
        wait_for_pending(&bridge, 1).await;

        bridge.stop();
        handle.await.unwrap().unwrap();

        let stats = bridge.get_stats().unwrap();
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.total_events, 1);
    }

    #[tokio::test]
    async fn test_poll_error_ends_run_and_stops() {
        let (bridge, tx, _control) = installed(10);
        tx.send(Err(BridgeError::Poll(std::io::Error::from_raw_os_error(
            libc::EBADF,
        ))))
        .unwrap();

        let err = bridge.run().await.unwrap_err();
        assert!(matches!(err, BridgeError::Poll(_)));
        assert_eq!(bridge.state(), BridgeState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_honoured_within_poll_interval() {
        let (bridge, _tx, _control) = installed(10);
        let handle = bridge.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        bridge.stop();
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("poll loop did not stop")
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_update_config_writes_merged_values() {
        let (bridge, _tx, control) = installed(10);

        let next = bridge
            .update_config(ConfigUpdate {
                fail_threshold: Some(3),
                monitor_all_connections: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(next.fail_threshold, 3);
        assert_eq!(bridge.runtime_config(), next);

        let writes = control.writes.lock().unwrap();
        let last = writes.last().unwrap();
        assert_eq!(last.fail_threshold, 3);
        assert_eq!(last.monitor_all_connections, 1);
        assert_eq!(last.window_ns, 300_000_000_000);
    }

    #[test]
    fn test_update_config_requires_probes() {
        let bridge = TestBridge::new(test_config(10));
        assert!(matches!(
            bridge.update_config(ConfigUpdate::default()),
            Err(BridgeError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_stats_report_tracked_sources_and_processes() {
        let (bridge, _tx, control) = installed(10);
        control.tracked.store(42, Ordering::Relaxed);

        assert_eq!(bridge.get_stats().unwrap().tracked_sources, 42);
        assert_eq!(bridge.process_stats(1).unwrap().unwrap().accept_count, 3);
        assert!(bridge.process_stats(2).unwrap().is_none());
        assert_eq!(bridge.all_process_stats().unwrap().len(), 1);
    }

    #[test]
    fn test_drop_detaches() {
        let (bridge, _tx, control) = installed(10);
        drop(bridge);
        assert!(control.detached.load(Ordering::SeqCst));
    }

    #[test]
    fn test_install_activity_writes_monitor_config() {
        let (bridge, _tx, control) = installed(10);
        assert_eq!(bridge.monitor_settings(), None);

        let settings = MonitorSettings {
            network: true,
            target_pid: 300,
            ..Default::default()
        };
        let _feed = with_activity(&bridge, settings);

        assert_eq!(bridge.monitor_settings(), Some(settings));
        let writes = control.monitor_writes.lock().unwrap();
        assert_eq!(writes.as_slice(), &[settings.to_kernel()]);
        assert_eq!(writes[0].target_pid, 300);
    }

    #[test]
    fn test_install_activity_requires_loaded_programs() {
        let bridge = TestBridge::new(test_config(10));
        let (_tx, rx) = mpsc::unbounded_channel();
        let err = bridge
            .install_activity(MockSource { rx }, MonitorSettings::default())
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidState {
                operation: "install_activity",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_activity_and_alerts_use_separate_queues() {
        let (bridge, tx, _control) = installed(100);
        let feed = with_activity(&bridge, MonitorSettings::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bridge.set_activity_callback(move |activity| {
            sink.lock().unwrap().push((activity.kind, activity.pid));
        });

        let handle = bridge.start().unwrap();
        feed.send(Ok(vec![
            activity_record(ACTIVITY_SYSCALL, 300),
            activity_record(ACTIVITY_TCP_RECV, 301),
        ]))
        .unwrap();
        tx.send(Ok(accept_burst(Ipv4Addr::new(10, 0, 0, 9), 2, 5))).unwrap();
        wait_for_activity(&bridge, 2).await;
        wait_for_pending(&bridge, 2).await;
        bridge.stop();
        handle.await.unwrap().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(ActivityKind::Syscall, 300), (ActivityKind::TcpRecv, 301)]
        );
        let activity = bridge.drain_activity(10);
        assert_eq!(activity.len(), 2);
        assert_eq!(activity[0].syscall_nr, Some(257));
        assert_eq!(bridge.drain_events(10).len(), 2);

        let stats = bridge.get_stats().unwrap();
        assert_eq!(stats.activity_events, 2);
        assert_eq!(stats.total_events, 2);
    }

    #[tokio::test]
    async fn test_activity_source_survives_restart() {
        let (bridge, _tx, _control) = installed(100);
        let feed = with_activity(&bridge, MonitorSettings::default());

        let handle = bridge.start().unwrap();
        feed.send(Ok(vec![activity_record(ACTIVITY_FILE_OPEN, 7)])).unwrap();
        wait_for_activity(&bridge, 1).await;
        bridge.stop();
        handle.await.unwrap().unwrap();

        let handle = bridge.start().unwrap();
        feed.send(Ok(vec![activity_record(ACTIVITY_PROCESS_FORK, 8)])).unwrap();
        wait_for_activity(&bridge, 2).await;
        bridge.stop();
        handle.await.unwrap().unwrap();

        let kinds: Vec<ActivityKind> = bridge.drain_activity(10).iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ActivityKind::FileOpen, ActivityKind::ProcessFork]);
    }

    #[tokio::test]
    async fn test_malformed_activity_is_counted() {
        let (bridge, _tx, _control) = installed(10);
        let feed = with_activity(&bridge, MonitorSettings::default());
        let handle = bridge.start().unwrap();

        feed.send(Ok(vec![
            Bytes::from_static(&[0u8; 16]),
            activity_record(0, 1),
            activity_record(ACTIVITY_SYSCALL, 1),
        ]))
        .unwrap();
        wait_for_activity(&bridge, 1).await;
        bridge.stop();
        handle.await.unwrap().unwrap();

        let stats = bridge.get_stats().unwrap();
        assert_eq!(stats.decode_errors, 2);
        assert_eq!(stats.activity_events, 1);
    }

    #[test]
    fn test_update_monitor_changes_target_pid() {
        let (bridge, _tx, control) = installed(10);
        assert!(matches!(
            bridge.update_monitor(MonitorUpdate::default()),
            Err(BridgeError::InvalidState { .. })
        ));

        let _feed = with_activity(&bridge, MonitorSettings::default());
        let next = bridge
            .update_monitor(MonitorUpdate {
                target_pid: Some(4242),
                files: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(next.target_pid, 4242);
        assert!(next.syscalls);
        assert_eq!(bridge.monitor_settings(), Some(next));

        let last = *control.monitor_writes.lock().unwrap().last().unwrap();
        assert!(last.traces(ACTIVITY_SYSCALL, 4242));
        assert!(!last.traces(ACTIVITY_SYSCALL, 4243));
        assert!(last.traces(ACTIVITY_FILE_OPEN, 4242));
    }

    #[test]
    fn test_monitored_processes_and_shutdown_clears_monitor() {
        let (bridge, _tx, _control) = installed(10);
        let _feed = with_activity(&bridge, MonitorSettings::default());

        let cat = bridge.monitored_process(300).unwrap().unwrap();
        assert_eq!(cat.syscall_count, 12);
        assert!(bridge.monitored_process(1).unwrap().is_none());
        assert_eq!(bridge.monitored_processes().unwrap().len(), 1);

        bridge.shutdown();
        assert_eq!(bridge.monitor_settings(), None);
        assert!(bridge.monitored_processes().unwrap().is_empty());
    }
}
