use crate::error::Result;
use crate::transport::{Completion, InFlight, RmaRequest, RmaWindow};
use crate::types::LockType;
use std::sync::Arc;
use std::task::Poll;

/// Progress of a `TryGet` through its lock, get, unlock sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    /// The lock was busy; retried on every poll.
    LockPending,
    /// Lock held, get in flight.
    Locked,
    /// Get finished; the unlock has not gone through yet.
    UnlockPending,
}

/// In-flight slot of a `TryGet` record.
///
/// Each poll advances as far as it can without blocking. The get's outcome
/// is reported only after the lock is released.
pub(crate) struct TryGetOp {
    window: Arc<dyn RmaWindow>,
    req: RmaRequest,
    lock_type: LockType,
    assert: u32,
    state: LockState,
    get: Option<InFlight>,
    outcome: Option<Result<()>>,
    finished: bool,
}

impl TryGetOp {
    pub(crate) fn new(
        window: Arc<dyn RmaWindow>,
        req: RmaRequest,
        lock_type: LockType,
        assert: u32,
    ) -> Self {
        Self {
            window,
            req,
            lock_type,
            assert,
            state: LockState::Unlocked,
            get: None,
            outcome: None,
            finished: false,
        }
    }
}

impl Completion for TryGetOp {
    fn poll_complete(&mut self) -> Poll<Result<()>> {
        if self.finished {
            return Poll::Ready(self.outcome.clone().unwrap_or(Ok(())));
        }
        loop {
            match self.state {
                LockState::Unlocked | LockState::LockPending => {
                    match self
                        .window
                        .try_lock(self.lock_type, self.req.target, self.assert)
                    {
                        Ok(true) => {
                            self.state = LockState::Locked;
                            // SAFETY: origin validity was promised when the
                            // owning request was built.
                            match unsafe { self.window.rget(&self.req) } {
                                Ok(op) => self.get = Some(op),
                                Err(e) => {
                                    self.outcome = Some(Err(e));
                                    self.state = LockState::UnlockPending;
                                }
                            }
                        }
                        Ok(false) => {
                            if self.state == LockState::Unlocked {
                                tracing::trace!(target = self.req.target, "try_get lock busy");
                            }
                            self.state = LockState::LockPending;
                            return Poll::Pending;
                        }
                        Err(e) => {
                            self.finished = true;
                            self.outcome = Some(Err(e.clone()));
                            return Poll::Ready(Err(e));
                        }
                    }
                }
                LockState::Locked => {
                    let Some(op) = self.get.as_mut() else {
                        self.state = LockState::UnlockPending;
                        continue;
                    };
                    match op.poll_complete() {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(r) => {
                            self.outcome = Some(r);
                            self.get = None;
                            self.state = LockState::UnlockPending;
                        }
                    }
                }
                LockState::UnlockPending => match self.window.try_unlock(self.req.target) {
                    Ok(true) => {
                        self.state = LockState::Unlocked;
                        self.finished = true;
                        return Poll::Ready(self.outcome.clone().unwrap_or(Ok(())));
                    }
                    Ok(false) => return Poll::Pending,
                    Err(e) => {
                        self.finished = true;
                        self.outcome = Some(Err(e.clone()));
                        return Poll::Ready(Err(e));
                    }
                },
            }
        }
    }
}
