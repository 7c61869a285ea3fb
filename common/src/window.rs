//! Per-source-IP sliding window
//!
//! The accept probe runs this on every inbound SSH connection. It is kept
//! free of map access so the kernel program and userspace tests execute
//! the exact same arithmetic: no allocation, no loops.
//!
//! Every accepted SSH connection counts as a failure. This is a proxy
//! signal; correlating with real authentication results happens downstream.
//!
//! `classify_connect` does the same for the connect return probe.

use crate::{constants::*, types::*};

/// Alert the probe should emit after observing one accept
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verdict {
    /// One of the ALERT_* constants
    pub alert_kind: u8,
    /// Count reported in the alert
    pub fail_count: u32,
    pub first_seen: u64,
    pub last_seen: u64,
}

impl Verdict {
    /// Verdict for the first connection ever seen from an IP
    ///
    /// Always an SSH_ATTEMPT with a zero count: the threshold is never
    /// consulted on first sight, whatever it is configured to.
    #[inline(always)]
    pub const fn first_sighting(now: u64) -> Self {
        Self {
            alert_kind: ALERT_SSH_ATTEMPT,
            fail_count: 0,
            first_seen: now,
            last_seen: now,
        }
    }

    #[inline(always)]
    pub fn is_threshold(&self) -> bool {
        self.alert_kind == ALERT_BRUTE_FORCE_THRESHOLD
    }
}

impl IpTrack {
    /// Apply one accepted connection at `now` to an existing entry
    ///
    /// 1. Roll the window over (hard reset, no carry-over) once more than
    ///    the window has elapsed since `window_start`.
    /// 2. Count the connection and stamp `last_seen`.
    /// 3. At or above the threshold, report BRUTE_FORCE_THRESHOLD and
    ///    restart counting so the next alert needs a full threshold again.
    ///    Below it, report SSH_AUTH_FAIL.
    #[inline(always)]
    pub fn record_accept(&mut self, now: u64, config: &IpsConfig) -> Verdict {
        // Concurrent probes on other CPUs can hand us a `now` slightly
        // older than window_start; treat that as zero elapsed time.
        if now.saturating_sub(self.window_start) > config.effective_window_ns() {
            self.fail_count = 0;
            self.window_start = now;
            self.first_seen = now;
        }

        self.fail_count = self.fail_count.saturating_add(1);
        self.last_seen = now;

        let mut verdict = Verdict {
            alert_kind: ALERT_SSH_AUTH_FAIL,
            fail_count: self.fail_count,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        };

        if self.fail_count >= config.effective_threshold() {
            verdict.alert_kind = ALERT_BRUTE_FORCE_THRESHOLD;
            self.fail_count = 0;
            self.window_start = now;
        }

        verdict
    }
}

/// Alert kind for a successful outbound connect, None when it is not reported
///
/// SSH on either end is always an SSH_ATTEMPT. Any other port pair is a
/// CONNECT_OBSERVED only when monitor_all_connections is set. A disabled
/// configuration reports nothing.
#[inline(always)]
pub fn classify_connect(local_port: u16, remote_port: u16, config: &IpsConfig) -> Option<u8> {
    if !config.is_enabled() {
        return None;
    }
    if remote_port == SSH_PORT || local_port == SSH_PORT {
        Some(ALERT_SSH_ATTEMPT)
    } else if config.monitors_all() {
        Some(ALERT_CONNECT_OBSERVED)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    fn config(threshold: u32, window_ns: u64) -> IpsConfig {
        IpsConfig {
            enabled: 1,
            fail_threshold: threshold,
            window_ns,
            monitor_all_connections: 0,
            _pad: 0,
        }
    }

    /// Drive the algorithm the way the accept probe does for one IP
    fn replay(times: &[u64], cfg: &IpsConfig) -> Vec<Verdict> {
        let mut entry: Option<IpTrack> = None;
        times
            .iter()
            .map(|&now| match entry.as_mut() {
                Some(track) => track.record_accept(now, cfg),
                None => {
                    entry = Some(IpTrack::new(now));
                    Verdict::first_sighting(now)
                }
            })
            .collect()
    }

    #[test]
    fn test_concrete_five_accept_scenario() {
        let cfg = config(5, 300 * SEC);
        let times: Vec<u64> = (0..6).map(|s| s * SEC).collect();
        let verdicts = replay(&times, &cfg);

        let kinds: Vec<(u8, u32)> = verdicts
            .iter()
            .map(|v| (v.alert_kind, v.fail_count))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ALERT_SSH_ATTEMPT, 0),
                (ALERT_SSH_AUTH_FAIL, 1),
                (ALERT_SSH_AUTH_FAIL, 2),
                (ALERT_SSH_AUTH_FAIL, 3),
                (ALERT_SSH_AUTH_FAIL, 4),
                (ALERT_BRUTE_FORCE_THRESHOLD, 5),
            ]
        );

        let threshold = verdicts[5];
        assert_eq!(threshold.first_seen, 0);
        assert_eq!(threshold.last_seen, 5 * SEC);
    }

    #[test]
    fn test_first_sighting_never_fires_threshold() {
        for threshold in [0, 1, 2, 5] {
            let verdicts = replay(&[42], &config(threshold, SEC));
            assert_eq!(verdicts[0], Verdict::first_sighting(42));
            assert!(!verdicts[0].is_threshold());
        }
    }

    #[test]
    fn test_threshold_one_fires_on_second_accept() {
        let verdicts = replay(&[0, 1, 2], &config(1, 300 * SEC));
        assert_eq!(verdicts[1].alert_kind, ALERT_BRUTE_FORCE_THRESHOLD);
        assert_eq!(verdicts[1].fail_count, 1);
        assert_eq!(verdicts[2].alert_kind, ALERT_BRUTE_FORCE_THRESHOLD);
    }

    #[test]
    fn test_alert_cadence_has_period_threshold() {
        let threshold = 4;
        let times: Vec<u64> = (0..=(3 * threshold as u64)).collect();
        let verdicts = replay(&times, &config(threshold, 300 * SEC));

        let fired: Vec<usize> = verdicts
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_threshold())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(fired, vec![4, 8, 12]);
        for i in fired {
            assert_eq!(verdicts[i].fail_count, threshold);
        }
    }

    #[test]
    fn test_window_rollover_discards_count() {
        let cfg = config(5, 10 * SEC);
        let verdicts = replay(&[0, SEC, 2 * SEC, 3 * SEC, 14 * SEC], &cfg);

        assert_eq!(verdicts[3].fail_count, 3);
        let rolled = verdicts[4];
        assert_eq!(rolled.alert_kind, ALERT_SSH_AUTH_FAIL);
        assert_eq!(rolled.fail_count, 1);
        assert_eq!(rolled.first_seen, 14 * SEC);
    }

    #[test]
    fn test_window_boundary_is_exclusive() {
        // Exactly `window` elapsed is still inside the window
        let cfg = config(5, 10 * SEC);
        let verdicts = replay(&[0, SEC, 10 * SEC], &cfg);
        assert_eq!(verdicts[2].fail_count, 2);
    }

    #[test]
    fn test_zero_config_uses_defaults() {
        let cfg = config(0, 0);
        let times: Vec<u64> = (0..6).map(|s| s * SEC).collect();
        let verdicts = replay(&times, &cfg);
        assert!(verdicts[5].is_threshold());
        assert_eq!(verdicts[5].fail_count, DEFAULT_FAIL_THRESHOLD);

        // Default window is five minutes
        let verdicts = replay(&[0, 1, 301 * SEC], &cfg);
        assert_eq!(verdicts[2].fail_count, 1);
    }

    #[test]
    fn test_clock_skew_does_not_roll_window() {
        let cfg = config(5, 10 * SEC);
        let mut track = IpTrack::new(5 * SEC);
        let verdict = track.record_accept(4 * SEC, &cfg);
        assert_eq!(verdict.fail_count, 1);
        assert_eq!(track.window_start, 5 * SEC);
    }

    fn monitor_all(mut cfg: IpsConfig) -> IpsConfig {
        cfg.monitor_all_connections = 1;
        cfg
    }

    #[test]
    fn test_connect_to_ssh_server_is_attempt() {
        let cfg = config(5, SEC);
        assert_eq!(classify_connect(51_000, SSH_PORT, &cfg), Some(ALERT_SSH_ATTEMPT));
        assert_eq!(
            classify_connect(51_000, SSH_PORT, &monitor_all(cfg)),
            Some(ALERT_SSH_ATTEMPT)
        );
    }

    #[test]
    fn test_connect_from_ssh_port_is_attempt() {
        let cfg = config(5, SEC);
        assert_eq!(classify_connect(SSH_PORT, 8080, &cfg), Some(ALERT_SSH_ATTEMPT));
    }

    #[test]
    fn test_non_ssh_connect_reported_only_when_monitoring_all() {
        let cfg = config(5, SEC);
        assert_eq!(classify_connect(51_000, 443, &cfg), None);
        assert_eq!(
            classify_connect(51_000, 443, &monitor_all(cfg)),
            Some(ALERT_CONNECT_OBSERVED)
        );
    }

    #[test]
    fn test_disabled_config_reports_no_connects() {
        let zeroed = IpsConfig::zeroed();
        assert_eq!(classify_connect(51_000, SSH_PORT, &zeroed), None);

        let mut off = monitor_all(config(5, SEC));
        off.enabled = 0;
        assert_eq!(classify_connect(SSH_PORT, 443, &off), None);
        assert_eq!(classify_connect(51_000, 443, &off), None);
    }
}
