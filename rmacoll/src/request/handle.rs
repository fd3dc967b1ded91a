use crate::comm::CommContext;
use crate::error::{Result, RmaCollError};
use crate::schedule::{BufferLoc, Schedule};
use crate::transport::{InFlight, RmaWindow};
use crate::trigger::TriggerGraph;
use crate::types::Tag;
use std::sync::Arc;

/// What a request executes.
pub(crate) enum Plan {
    Rounds(Schedule),
    Triggers(TriggerGraph),
}

/// Lifecycle of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    /// Built but not started (persistent requests between activations).
    Inactive,
    Active,
    Finished,
    Failed(RmaCollError),
}

/// Outcome of one progress call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Operations are still outstanding.
    Continue,
    Done,
}

/// Execution state of one collective request.
///
/// Owned by a [`CollectiveRequest`](super::CollectiveRequest) and the
/// component's active set; only one caller drives it at a time.
pub struct Handle {
    pub(super) comm: Arc<CommContext>,
    pub(super) tag: Tag,
    pub(super) plan: Option<Plan>,
    /// Offset of the current round's count field.
    pub(super) round_offset: usize,
    pub(super) round_index: usize,
    pub(super) in_flight: Vec<InFlight>,
    pub(super) state: RequestState,
    /// Issue error recorded while the round's other operations drain.
    pub(super) error: Option<RmaCollError>,
    pub(super) staging: Option<Vec<u8>>,
    pub(super) window: Option<Arc<dyn RmaWindow>>,
    pub(super) persistent: bool,
}

impl Handle {
    pub(super) fn new(
        comm: Arc<CommContext>,
        tag: Tag,
        plan: Plan,
        window: Option<Arc<dyn RmaWindow>>,
        persistent: bool,
    ) -> Self {
        Self {
            comm,
            tag,
            plan: Some(plan),
            round_offset: 0,
            round_index: 0,
            in_flight: Vec::new(),
            state: RequestState::Inactive,
            error: None,
            staging: None,
            window,
            persistent,
        }
    }

    pub fn state(&self) -> &RequestState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == RequestState::Active
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Number of operations issued and not yet drained.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Index of the round being executed.
    pub fn round_index(&self) -> usize {
        self.round_index
    }

    pub(super) fn window(&self) -> Result<&Arc<dyn RmaWindow>> {
        self.window
            .as_ref()
            .ok_or_else(|| RmaCollError::Window("request has no window".into()))
    }

    /// Absolute address of a record buffer of `bytes` length.
    pub(super) fn resolve(&mut self, loc: BufferLoc, bytes: usize) -> Result<u64> {
        match loc {
            BufferLoc::User(ptr) => {
                if ptr == 0 && bytes > 0 {
                    return Err(RmaCollError::invalid("null user buffer"));
                }
                Ok(ptr)
            }
            BufferLoc::Staging(off) => {
                let staging = self
                    .staging
                    .as_mut()
                    .ok_or_else(|| RmaCollError::invalid("record uses staging but none is set"))?;
                let start = usize::try_from(off)
                    .ok()
                    .filter(|o| o.checked_add(bytes).is_some_and(|end| end <= staging.len()))
                    .ok_or_else(|| {
                        RmaCollError::invalid(format!(
                            "staging range {off}+{bytes} outside {}-byte staging buffer",
                            staging.len()
                        ))
                    })?;
                Ok(staging.as_mut_ptr() as u64 + start as u64)
            }
        }
    }

    /// Arm the request: reset per-activation state and issue round 0.
    pub(super) fn activate(&mut self) -> Result<()> {
        if self.state == RequestState::Active {
            return Err(RmaCollError::RequestActive);
        }
        self.in_flight.clear();
        self.error = None;
        self.round_index = 0;
        self.round_offset = crate::schedule::scan::SIZE_FIELD;
        self.state = RequestState::Active;
        tracing::debug!(
            rank = self.comm.rank(),
            tag = self.tag,
            persistent = self.persistent,
            "request started"
        );

        let result = if matches!(self.plan, Some(Plan::Rounds(_))) {
            self.start_round()
        } else if let Some(Plan::Triggers(graph)) = self.plan.as_mut() {
            graph.activate()
        } else {
            Err(RmaCollError::invalid("request resources were released"))
        };
        if let Err(e) = &result {
            self.error.get_or_insert_with(|| e.clone());
            if self.in_flight.is_empty() {
                let e = self.error.take().unwrap_or_else(|| e.clone());
                return Err(self.finalize_failed(e));
            }
        }
        result
    }

    pub(super) fn finalize_finished(&mut self) {
        self.in_flight.clear();
        self.state = RequestState::Finished;
        tracing::debug!(
            rank = self.comm.rank(),
            tag = self.tag,
            rounds = self.round_index + 1,
            "request finished"
        );
        self.release_resources();
    }

    pub(super) fn finalize_failed(&mut self, e: RmaCollError) -> RmaCollError {
        self.in_flight.clear();
        tracing::error!(
            rank = self.comm.rank(),
            tag = self.tag,
            round = self.round_index,
            error = %e,
            "request aborted"
        );
        self.state = RequestState::Failed(e.clone());
        self.release_resources();
        e
    }

    fn release_resources(&mut self) {
        if self.persistent {
            return;
        }
        self.plan = None;
        self.staging = None;
        self.window = None;
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("tag", &self.tag)
            .field("state", &self.state)
            .field("round", &self.round_index)
            .field("in_flight", &self.in_flight.len())
            .field("persistent", &self.persistent)
            .finish()
    }
}
