//! Host-side sliding window tracker
//!
//! Mirrors FAILED_LOGINS: a fixed number of per-IP entries, evicting the
//! least recently used one when full. The per-entry arithmetic is the
//! `probe-common` code the accept probe runs, so verdicts match the
//! kernel's for the same sequence of accepts.

use std::{collections::HashMap, net::Ipv4Addr};

use probe_common::{types::IpTrack, window::Verdict, IpsConfig};

struct Slot {
    ip: Ipv4Addr,
    track: IpTrack,
    last_used: u64,
}

pub struct WindowTracker {
    config: IpsConfig,
    capacity: usize,
    index: HashMap<Ipv4Addr, usize>,
    slots: Vec<Slot>,
    tick: u64,
    evictions: u64,
}

impl WindowTracker {
    /// Create a tracker holding at most `capacity` source IPs
    pub fn new(capacity: usize, config: IpsConfig) -> Self {
        let capacity = capacity.max(1);
        Self {
            config,
            capacity,
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            tick: 0,
            evictions: 0,
        }
    }

    /// Replace the configuration used for subsequent accepts
    pub fn set_config(&mut self, config: IpsConfig) {
        self.config = config;
    }

    /// Record one accepted SSH connection from `ip` at `now` (nanoseconds)
    pub fn observe(&mut self, ip: Ipv4Addr, now: u64) -> Verdict {
        self.tick += 1;

        if let Some(&slot) = self.index.get(&ip) {
            let entry = &mut self.slots[slot];
            entry.last_used = self.tick;
            return entry.track.record_accept(now, &self.config);
        }

        let fresh = Slot {
            ip,
            track: IpTrack::new(now),
            last_used: self.tick,
        };

        if self.slots.len() < self.capacity {
            self.index.insert(ip, self.slots.len());
            self.slots.push(fresh);
        } else {
            let victim = self.least_recent();
            self.index.remove(&self.slots[victim].ip);
            self.index.insert(ip, victim);
            self.slots[victim] = fresh;
            self.evictions += 1;
        }

        Verdict::first_sighting(now)
    }

    fn least_recent(&self) -> usize {
        self.slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.last_used)
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Current entry for `ip`, if tracked
    pub fn get(&self, ip: Ipv4Addr) -> Option<&IpTrack> {
        self.index.get(&ip).map(|&slot| &self.slots[slot].track)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}
