use crate::config::RmaCollConfig;
use crate::request::{Handle, Progress};
use crate::types::Rank;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Process-wide set of active requests.
///
/// Requests are added by `start()` and removed once they finish or fail.
/// The surrounding event loop calls [`RmaCollComponent::progress_all`] to
/// drive every request nobody is currently waiting on, including requests
/// whose owner dropped them while still active.
pub struct RmaCollComponent {
    config: RmaCollConfig,
    active: Mutex<Vec<Arc<Mutex<Handle>>>>,
    registered_comms: AtomicUsize,
    progress_registered: AtomicBool,
}

impl RmaCollComponent {
    pub fn new(config: RmaCollConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            active: Mutex::new(Vec::new()),
            registered_comms: AtomicUsize::new(0),
            progress_registered: AtomicBool::new(false),
        })
    }

    /// Component configured from `RMACOLL_*` environment variables.
    pub fn from_env() -> Arc<Self> {
        Self::new(RmaCollConfig::from_env())
    }

    pub fn config(&self) -> &RmaCollConfig {
        &self.config
    }

    pub(crate) fn register_comm(&self, rank: Rank) {
        let n = self.registered_comms.fetch_add(1, Ordering::AcqRel) + 1;
        if n == 1 && !self.progress_registered.swap(true, Ordering::AcqRel) {
            tracing::debug!(rank, "rmacoll progress registered");
        }
    }

    /// Number of communicators that have issued at least one request.
    pub fn registered_comms(&self) -> usize {
        self.registered_comms.load(Ordering::Acquire)
    }

    pub fn is_progress_registered(&self) -> bool {
        self.progress_registered.load(Ordering::Acquire)
    }

    pub(crate) fn enqueue(&self, handle: Arc<Mutex<Handle>>) {
        let mut active = self.lock_active();
        if !active.iter().any(|h| Arc::ptr_eq(h, &handle)) {
            active.push(handle);
        }
    }

    pub(crate) fn remove(&self, handle: &Arc<Mutex<Handle>>) {
        self.lock_active().retain(|h| !Arc::ptr_eq(h, handle));
    }

    /// Number of requests still in the active set.
    pub fn active_requests(&self) -> usize {
        self.lock_active().len()
    }

    /// Progress every active request once.
    ///
    /// Requests locked by another caller are skipped. Finished and failed
    /// requests leave the set; the number that left is returned.
    pub fn progress_all(&self) -> usize {
        let snapshot: Vec<Arc<Mutex<Handle>>> = self.lock_active().clone();
        let mut retired = Vec::new();
        for h in &snapshot {
            let Ok(mut handle) = h.try_lock() else {
                continue;
            };
            match handle.progress() {
                Ok(Progress::Continue) => {}
                Ok(Progress::Done) | Err(_) => retired.push(Arc::clone(h)),
            }
        }
        if !retired.is_empty() {
            // A request restarted since it was polled stays in the set.
            self.lock_active().retain(|h| {
                !(retired.iter().any(|r| Arc::ptr_eq(r, h))
                    && h.try_lock().is_ok_and(|g| !g.is_active()))
            });
        }
        retired.len()
    }

    fn lock_active(&self) -> MutexGuard<'_, Vec<Arc<Mutex<Handle>>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for RmaCollComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RmaCollComponent")
            .field("active", &self.active_requests())
            .field("registered_comms", &self.registered_comms())
            .finish()
    }
}
