//! Expiry of abandoned transactions.
//!
//! Every root coordinator is registered with a deadline. A background thread
//! scans the entries at a fixed interval and rolls back any coordinator that
//! is past its deadline and not yet terminal, through the same public
//! `rollback` a caller would use. The timer holds coordinators weakly.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use braid_common::prelude::*;

use crate::coordinator::Coordinator;

/// Told about every transaction the timer rolled back.
pub trait ExpiryListener: Send + Sync {
    fn on_expired(&self, coordinator: &Arc<Coordinator>);
}

struct ExpiryEntry {
    deadline: Instant,
    coordinator: Weak<Coordinator>,
}

pub struct ExpiryTimer {
    entries: DashMap<GlobalId, ExpiryEntry>,
    interval: Duration,
    running: Arc<AtomicBool>,
    expired_count: AtomicU64,
    listener: RwLock<Option<Weak<dyn ExpiryListener>>>,
}

impl ExpiryTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            interval,
            running: Arc::new(AtomicBool::new(false)),
            expired_count: AtomicU64::new(0),
            listener: RwLock::new(None),
        }
    }

    pub fn set_listener(&self, listener: Weak<dyn ExpiryListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Track `coordinator` until its deadline.
    pub fn register(&self, coordinator: &Arc<Coordinator>) {
        self.entries.insert(
            coordinator.xid().global_id,
            ExpiryEntry {
                deadline: coordinator.deadline(),
                coordinator: Arc::downgrade(coordinator),
            },
        );
    }

    /// Stop tracking a transaction. Returns false when it was not tracked,
    /// for instance because it already expired.
    pub fn remove(&self, global_id: GlobalId) -> bool {
        self.entries.remove(&global_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Roll back every tracked transaction whose deadline passed.
    ///
    /// Returns the Xids that were rolled back. A transaction whose commit is
    /// in flight is waited for and left with the commit's outcome.
    pub fn expire_due(&self) -> Vec<Xid> {
        let now = Instant::now();
        let due: Vec<GlobalId> = self
            .entries
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| *e.key())
            .collect();

        let mut expired = Vec::new();
        for global_id in due {
            // Whoever removes the entry owns the expiry.
            let Some((_, entry)) = self.entries.remove_if(&global_id, |_, e| e.deadline <= now) else {
                continue;
            };
            let Some(coordinator) = entry.coordinator.upgrade() else {
                continue;
            };
            if coordinator.state().is_terminal() {
                continue;
            }

            warn!(
                "Transaction {} exceeded its deadline in state {}, rolling back",
                coordinator.xid(),
                coordinator.state()
            );
            match coordinator.rollback() {
                Ok(XaState::RolledBack) => {
                    self.expired_count.fetch_add(1, Ordering::SeqCst);
                    expired.push(coordinator);
                }
                Ok(state) => debug!("Transaction {} finished as {} before expiry", coordinator.xid(), state),
                Err(e) => error!("Rolling back expired transaction {} failed: {}", coordinator.xid(), e),
            }
        }

        if !expired.is_empty() {
            let listener = self.listener.read().as_ref().and_then(Weak::upgrade);
            if let Some(listener) = listener {
                for coordinator in &expired {
                    listener.on_expired(coordinator);
                }
            }
        }
        expired.iter().map(|c| c.xid()).collect()
    }

    /// Start the background scan. Returns `None` when already running.
    pub fn start(self: &Arc<Self>) -> Result<Option<std::thread::JoinHandle<()>>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        let timer = Arc::downgrade(self);
        let interval = self.interval;
        let running = self.running.clone();

        let handle = std::thread::Builder::new()
            .name("braid-expiry".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);

                    let Some(timer) = timer.upgrade() else {
                        break;
                    };
                    timer.expire_due();
                }
                debug!("Expiry timer stopped");
            })?;
        Ok(Some(handle))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of transactions rolled back by expiry.
    pub fn expired_count(&self) -> u64 {
        self.expired_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn coordinator(id: u64, timeout: Duration) -> Arc<Coordinator> {
        let config = XaConfig {
            transaction_timeout: timeout,
            ..Default::default()
        };
        let c = Arc::new(Coordinator::new(Xid::root(GlobalId(id)), false, &config));
        c.begin().unwrap();
        c
    }

    #[derive(Default)]
    struct Seen(Mutex<Vec<Xid>>);

    impl ExpiryListener for Seen {
        fn on_expired(&self, coordinator: &Arc<Coordinator>) {
            self.0.lock().push(coordinator.xid());
        }
    }

    #[test]
    fn test_overdue_transaction_rolled_back() {
        let timer = ExpiryTimer::new(Duration::from_millis(10));
        let late = coordinator(1, Duration::ZERO);
        let fresh = coordinator(2, Duration::from_secs(60));
        timer.register(&late);
        timer.register(&fresh);

        let expired = timer.expire_due();
        assert_eq!(expired, vec![late.xid()]);
        assert_eq!(late.state(), XaState::RolledBack);
        assert_eq!(fresh.state(), XaState::Active);
        assert_eq!(timer.len(), 1);
        assert_eq!(timer.expired_count(), 1);
    }

    #[test]
    fn test_terminal_transaction_not_touched() {
        let timer = ExpiryTimer::new(Duration::from_millis(10));
        let done = coordinator(1, Duration::ZERO);
        done.commit().unwrap();
        timer.register(&done);

        assert!(timer.expire_due().is_empty());
        assert_eq!(done.state(), XaState::Committed);
        assert!(timer.is_empty());
    }

    #[test]
    fn test_dropped_coordinator_is_forgotten() {
        let timer = ExpiryTimer::new(Duration::from_millis(10));
        timer.register(&coordinator(1, Duration::ZERO));
        assert!(timer.expire_due().is_empty());
        assert!(timer.is_empty());
    }

    #[test]
    fn test_listener_notified() {
        let timer = ExpiryTimer::new(Duration::from_millis(10));
        let seen = Arc::new(Seen::default());
        let listener: Arc<dyn ExpiryListener> = seen.clone();
        timer.set_listener(Arc::downgrade(&listener));

        let late = coordinator(9, Duration::ZERO);
        timer.register(&late);
        timer.expire_due();
        assert_eq!(*seen.0.lock(), vec![late.xid()]);
    }

    #[test]
    fn test_background_thread() {
        let timer = Arc::new(ExpiryTimer::new(Duration::from_millis(5)));
        let late = coordinator(1, Duration::from_millis(20));
        timer.register(&late);

        let handle = timer.start().unwrap().unwrap();
        assert!(timer.is_running());
        assert!(timer.start().unwrap().is_none());

        let deadline = Instant::now() + Duration::from_secs(5);
        while late.state() != XaState::RolledBack && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        timer.stop();
        handle.join().unwrap();
        assert_eq!(late.state(), XaState::RolledBack);
        assert!(!timer.is_running());
    }
}
