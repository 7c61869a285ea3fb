//! Record delivery
//!
//! Every decoded record goes two ways: into a bounded pull queue drained
//! by the bridge's drain methods, and to the registered callback if any.
//! The queue drops its oldest entry when full so a slow consumer never
//! stalls the poll loop. Alerts and activity records each get their own
//! bus.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use crate::types::{Activity, Alert};

/// Callback invoked for every published record, on the poll task
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub type AlertCallback = Callback<Alert>;
pub type ActivityCallback = Callback<Activity>;

pub struct EventBus<T = Alert> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    callback: Mutex<Option<Callback<T>>>,
    total: AtomicU64,
    overflows: AtomicU64,
}

impl<T: Clone> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            callback: Mutex::new(None),
            total: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
        }
    }

    /// Queue a record, then hand it to the callback
    ///
    /// The callback runs after the queue lock is released, so it may
    /// call back into `drain`.
    pub fn publish(&self, record: T) {
        let callback = lock(&self.callback).clone();

        match callback {
            Some(cb) => {
                self.enqueue(record.clone());
                cb(&record);
            }
            None => self.enqueue(record),
        }
    }

    fn enqueue(&self, record: T) {
        let mut queue = lock(&self.queue);
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(record);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove up to `max` records, oldest first
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut queue = lock(&self.queue);
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    pub fn set_callback(&self, callback: Option<Callback<T>>) {
        *lock(&self.callback) = callback;
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Records published since creation
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Records dropped from the front of a full queue
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }
}

/// Lock a mutex, recovering the data if a callback panicked while holding it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlertEvent;
    use probe_common::constants::ALERT_SSH_AUTH_FAIL;

    fn alert(n: u32) -> Alert {
        let mut event = AlertEvent::zeroed();
        event.alert_kind = ALERT_SSH_AUTH_FAIL;
        event.fail_count = n;
        Alert::try_from(event).unwrap()
    }

    #[test]
    fn test_drain_returns_oldest_first() {
        let bus = EventBus::new(10);
        for n in 0..5 {
            bus.publish(alert(n));
        }

        let first: Vec<u32> = bus.drain(2).iter().map(|a| a.fail_count).collect();
        assert_eq!(first, vec![0, 1]);

        let rest: Vec<u32> = bus.drain(100).iter().map(|a| a.fail_count).collect();
        assert_eq!(rest, vec![2, 3, 4]);
        assert!(bus.drain(1).is_empty());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let bus = EventBus::new(3);
        for n in 0..7 {
            bus.publish(alert(n));
        }

        assert_eq!(bus.pending(), 3);
        assert_eq!(bus.overflows(), 4);
        assert_eq!(bus.total(), 7);

        let kept: Vec<u32> = bus.drain(10).iter().map(|a| a.fail_count).collect();
        assert_eq!(kept, vec![4, 5, 6]);
    }

    #[test]
    fn test_callback_sees_every_alert_and_queue_still_fills() {
        let bus = Arc::new(EventBus::new(10));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.set_callback(Some(Arc::new(move |a: &Alert| {
            sink.lock().unwrap().push(a.fail_count);
        })));

        bus.publish(alert(1));
        bus.publish(alert(2));

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(bus.pending(), 2);

        bus.set_callback(None);
        bus.publish(alert(3));
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(bus.pending(), 3);
    }

    #[test]
    fn test_callback_may_drain_reentrantly() {
        let bus = Arc::new(EventBus::new(10));
        let drained = Arc::new(AtomicU64::new(0));

        let inner = Arc::clone(&bus);
        let count = Arc::clone(&drained);
        bus.set_callback(Some(Arc::new(move |_: &Alert| {
            let n = inner.drain(10).len() as u64;
            count.fetch_add(n, Ordering::Relaxed);
        })));

        bus.publish(alert(1));
        bus.publish(alert(2));
        assert_eq!(drained.load(Ordering::Relaxed), 2);
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn test_activity_bus_is_independent() {
        let alerts: EventBus<Alert> = EventBus::new(2);
        let activity: EventBus<Activity> = EventBus::new(1);

        let mut event = crate::types::ActivityEvent::zeroed();
        event.kind = probe_common::constants::ACTIVITY_SYSCALL;
        for pid in 0..3 {
            event.pid = pid;
            activity.publish(Activity::try_from(event).unwrap());
        }
        alerts.publish(alert(1));

        assert_eq!(activity.overflows(), 2);
        assert_eq!(activity.drain(5)[0].pid, 2);
        assert_eq!(alerts.pending(), 1);
        assert_eq!(alerts.overflows(), 0);
    }
}
