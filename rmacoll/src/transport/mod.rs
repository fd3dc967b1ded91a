//! Collaborator traits consumed by the execution core.
//!
//! The core never moves bytes between processes itself. One-sided traffic
//! goes through an [`RmaWindow`], two-sided traffic and address exchange
//! through a [`Transport`]. Every asynchronous operation hands back an
//! [`InFlight`] completion that the progress engine polls without blocking.

pub mod loopback;

use crate::error::Result;
use crate::types::{DataType, LockType, Rank, Tag};
use std::sync::Arc;
use std::task::Poll;

/// A non-blocking completion handle for one issued operation.
pub trait Completion: Send {
    /// Poll once. Never blocks.
    ///
    /// Returns `Ready(Ok(()))` exactly once the operation has finished;
    /// polling again after that keeps returning `Ready`.
    fn poll_complete(&mut self) -> Poll<Result<()>>;
}

/// An issued operation owned by whoever drives it to completion.
pub type InFlight = Box<dyn Completion>;

/// A completion that is already resolved.
pub struct Ready(Option<Result<()>>);

impl Ready {
    pub fn ok() -> InFlight {
        Box::new(Ready(Some(Ok(()))))
    }

    pub fn err(e: crate::error::RmaCollError) -> InFlight {
        Box::new(Ready(Some(Err(e))))
    }
}

impl Completion for Ready {
    fn poll_complete(&mut self) -> Poll<Result<()>> {
        match self.0.take() {
            Some(r) => Poll::Ready(r),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Arguments of a one-sided put or get.
///
/// `origin` is a local address. `target_disp` is an absolute address inside
/// the target rank's attached window memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaRequest {
    pub origin: u64,
    pub origin_count: usize,
    pub origin_dtype: DataType,
    pub target: Rank,
    pub target_disp: u64,
    pub target_count: usize,
    pub target_dtype: DataType,
}

impl RmaRequest {
    pub fn origin_bytes(&self) -> usize {
        self.origin_count * self.origin_dtype.size_in_bytes()
    }

    pub fn target_bytes(&self) -> usize {
        self.target_count * self.target_dtype.size_in_bytes()
    }
}

/// A dynamic one-sided memory window shared by every rank of a communicator.
///
/// Windows are created collectively; memory is exposed by [`attach`] and
/// addressed remotely by absolute address.
///
/// [`attach`]: RmaWindow::attach
pub trait RmaWindow: Send + Sync {
    /// Expose `[base, base + len)` to remote ranks.
    ///
    /// # Safety
    /// The region must stay valid until the window is released or dropped.
    /// Remote ranks may read and write it concurrently.
    unsafe fn attach(&self, base: u64, len: usize) -> Result<()>;

    /// Open a shared access epoch to every rank.
    fn lock_all(&self) -> Result<()>;

    /// Close the epoch opened by [`RmaWindow::lock_all`].
    fn unlock_all(&self) -> Result<()>;

    /// Try to take a passive-target lock on `target`. `Ok(false)` means busy.
    fn try_lock(&self, lock_type: LockType, target: Rank, assert: u32) -> Result<bool>;

    /// Try to release a lock taken by [`RmaWindow::try_lock`]. `Ok(false)`
    /// means the unlock cannot complete yet and must be retried.
    fn try_unlock(&self, target: Rank) -> Result<bool>;

    /// Issue a put from local memory into the target's window.
    ///
    /// # Safety
    /// `req.origin` must be valid for reads of `req.origin_bytes()` until the
    /// returned completion reports done.
    unsafe fn rput(&self, req: &RmaRequest) -> Result<InFlight>;

    /// Issue a get from the target's window into local memory.
    ///
    /// # Safety
    /// `req.origin` must be valid for writes of `req.origin_bytes()` until the
    /// returned completion reports done.
    unsafe fn rget(&self, req: &RmaRequest) -> Result<InFlight>;

    /// Collective release of the window. Completes once every rank has
    /// released.
    fn release(&self) -> Result<InFlight>;
}

/// Point-to-point transport and membership of one rank.
pub trait Transport: Send + Sync {
    fn rank(&self) -> Rank;

    fn world_size(&self) -> u32;

    /// Collectively create a dynamic window. Every rank must call this in the
    /// same order.
    fn create_window(&self) -> Result<Arc<dyn RmaWindow>>;

    /// Post a tagged send.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `count` elements until completion.
    unsafe fn isend(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        peer: Rank,
        tag: Tag,
    ) -> Result<InFlight>;

    /// Post a tagged receive.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `count` elements until completion.
    unsafe fn irecv(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        peer: Rank,
        tag: Tag,
    ) -> Result<InFlight>;

    /// Blocking all-to-all of one word per rank: `values[j]` goes to rank
    /// `j`, and the result holds the word every rank sent to this one.
    fn exchange(&self, values: &[u64]) -> Result<Vec<u64>>;
}
