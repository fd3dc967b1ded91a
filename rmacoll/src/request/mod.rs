//! Collective requests: construction, start, and completion.
//!
//! A [`CollectiveRequest`] wraps a [`Handle`] shared with the process-wide
//! [`RmaCollComponent`]. Whoever polls first advances it: the owner through
//! [`CollectiveRequest::test`] or [`CollectiveRequest::wait`], or the event
//! loop through [`RmaCollComponent::progress_all`].

mod handle;
mod progress;
mod try_get;

pub use handle::{Handle, Progress, RequestState};
pub use try_get::LockState;

use crate::comm::CommContext;
use crate::component::RmaCollComponent;
use crate::error::{Result, RmaCollError};
use crate::schedule::Schedule;
use crate::transport::RmaWindow;
use crate::trigger::TriggerGraph;
use crate::types::Tag;
use handle::Plan;
use std::sync::{Arc, Mutex, MutexGuard};

/// A nonblocking collective operation.
///
/// Non-persistent requests run once and release their schedule, staging
/// buffer and window when they finish or fail. Persistent requests keep
/// them and can be started again after every completion.
///
/// Dropping an active request does not cancel it: the component keeps
/// driving it until its operations have drained.
pub struct CollectiveRequest {
    handle: Arc<Mutex<Handle>>,
    component: Arc<RmaCollComponent>,
    tag: Tag,
    wait_spin: u32,
    persistent: bool,
    noop: bool,
}

impl CollectiveRequest {
    /// Build a request that executes a committed round schedule.
    ///
    /// A non-persistent request built from the empty schedule is finished
    /// right away and never enters the active set.
    ///
    /// # Safety
    /// Every user buffer address recorded in the schedule must stay valid,
    /// with the access the record implies, until the request completes.
    pub unsafe fn from_schedule(
        comm: &Arc<CommContext>,
        schedule: Schedule,
        persistent: bool,
    ) -> Result<Self> {
        Self::build_rounds(comm, schedule, None, persistent)
    }

    /// Like [`CollectiveRequest::from_schedule`], with a window for the
    /// schedule's one-sided records.
    ///
    /// # Safety
    /// Same contract as [`CollectiveRequest::from_schedule`]. Target
    /// addresses must be attached to `window` by their owners.
    pub unsafe fn from_schedule_with_window(
        comm: &Arc<CommContext>,
        schedule: Schedule,
        window: Arc<dyn RmaWindow>,
        persistent: bool,
    ) -> Result<Self> {
        Self::build_rounds(comm, schedule, Some(window), persistent)
    }

    fn build_rounds(
        comm: &Arc<CommContext>,
        schedule: Schedule,
        window: Option<Arc<dyn RmaWindow>>,
        persistent: bool,
    ) -> Result<Self> {
        if !schedule.is_committed() {
            tracing::warn!(rank = comm.rank(), "request built from an uncommitted schedule");
            return Err(RmaCollError::invalid("schedule must be committed"));
        }
        let noop = schedule.is_noop();
        let tag = comm.reserve_tag()?;
        let mut handle = Handle::new(
            Arc::clone(comm),
            tag,
            Plan::Rounds(schedule),
            window,
            persistent,
        );
        if noop && !persistent {
            handle.finalize_finished();
        }
        tracing::debug!(
            rank = comm.rank(),
            tag,
            persistent,
            noop,
            "request built from schedule"
        );
        Ok(Self::wrap(comm, handle, persistent, noop))
    }

    /// Build a request that executes a trigger graph.
    ///
    /// `window` is kept alive with the request; the graph holds its own
    /// reference for the operations it issues.
    pub fn from_trigger_graph(
        comm: &Arc<CommContext>,
        graph: TriggerGraph,
        window: Option<Arc<dyn RmaWindow>>,
        persistent: bool,
    ) -> Result<Self> {
        let tag = comm.reserve_tag()?;
        tracing::debug!(
            rank = comm.rank(),
            tag,
            persistent,
            nodes = graph.nodes().len(),
            "request built from trigger graph"
        );
        let handle = Handle::new(
            Arc::clone(comm),
            tag,
            Plan::Triggers(graph),
            window,
            persistent,
        );
        Ok(Self::wrap(comm, handle, persistent, false))
    }

    /// A request with nothing to do. Already complete.
    pub fn noop(comm: &Arc<CommContext>) -> Result<Self> {
        let mut schedule = Schedule::with_config(comm.config());
        schedule.commit()?;
        // SAFETY: the empty schedule references no memory.
        unsafe { Self::from_schedule(comm, schedule, false) }
    }

    fn wrap(comm: &Arc<CommContext>, handle: Handle, persistent: bool, noop: bool) -> Self {
        Self {
            tag: handle.tag(),
            handle: Arc::new(Mutex::new(handle)),
            component: Arc::clone(comm.component()),
            wait_spin: comm.config().wait_spin,
            persistent,
            noop,
        }
    }

    /// Attach the staging buffer `Staging` records are resolved against.
    pub fn with_staging(self, staging: Vec<u8>) -> Result<Self> {
        {
            let mut handle = self.lock()?;
            if handle.is_active() {
                return Err(RmaCollError::RequestActive);
            }
            handle.staging = Some(staging);
        }
        Ok(self)
    }

    /// Arm the request and issue its first round.
    ///
    /// On success the request joins the component's active set. If the
    /// first round fails to issue, the error is returned; operations that
    /// were already issued still drain and the request then fails.
    pub fn start(&self) -> Result<()> {
        let (result, active) = {
            let mut handle = self.lock()?;
            if !self.persistent && *handle.state() != RequestState::Inactive {
                if self.noop {
                    return Ok(());
                }
                return Err(RmaCollError::invalid(
                    "a non-persistent request can only be started once",
                ));
            }
            let result = handle.activate();
            (result, handle.is_active())
        };
        if active {
            self.component.enqueue(Arc::clone(&self.handle));
        }
        result
    }

    /// Progress once. `Ok(true)` when the request has finished.
    pub fn test(&self) -> Result<bool> {
        let outcome = self.lock()?.progress();
        match outcome {
            Ok(Progress::Continue) => Ok(false),
            Ok(Progress::Done) => {
                self.component.remove(&self.handle);
                Ok(true)
            }
            Err(e) => {
                self.component.remove(&self.handle);
                Err(e)
            }
        }
    }

    /// Wait for completion, yielding to the runtime between bursts of polls.
    pub async fn wait(&self) -> Result<()> {
        loop {
            for _ in 0..self.wait_spin.max(1) {
                if self.test()? {
                    return Ok(());
                }
            }
            tokio::task::yield_now().await;
        }
    }

    /// Wait for completion on the calling thread.
    pub fn wait_blocking(&self) -> Result<()> {
        loop {
            for _ in 0..self.wait_spin.max(1) {
                if self.test()? {
                    return Ok(());
                }
            }
            std::thread::yield_now();
        }
    }

    pub fn state(&self) -> Result<RequestState> {
        Ok(self.lock()?.state().clone())
    }

    pub fn is_complete(&self) -> bool {
        self.lock()
            .is_ok_and(|h| *h.state() == RequestState::Finished)
    }

    /// The error a failed request reports.
    pub fn error(&self) -> Option<RmaCollError> {
        match self.lock().ok()?.state() {
            RequestState::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn lock(&self) -> Result<MutexGuard<'_, Handle>> {
        self.handle
            .lock()
            .map_err(|_| RmaCollError::LockPoisoned("request handle"))
    }
}

impl std::fmt::Debug for CollectiveRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectiveRequest")
            .field("tag", &self.tag)
            .field("persistent", &self.persistent)
            .field("handle", &self.handle)
            .finish()
    }
}

/// A group of requests that can be waited on together.
pub struct RequestGroup {
    requests: Vec<CollectiveRequest>,
}

impl RequestGroup {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
        }
    }

    pub fn push(&mut self, request: CollectiveRequest) {
        self.requests.push(request);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Wait for every request in the group.
    ///
    /// All requests are driven concurrently and all are awaited; the first
    /// error in push order is returned.
    pub async fn wait_all(self) -> Result<()> {
        let results = futures::future::join_all(self.requests.iter().map(|r| r.wait())).await;
        results.into_iter().collect()
    }
}

impl Default for RequestGroup {
    fn default() -> Self {
        Self::new()
    }
}
