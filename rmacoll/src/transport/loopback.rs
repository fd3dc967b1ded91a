//! In-process fabric: N ranks living as threads of one process.
//!
//! Every rank gets a [`LoopbackTransport`]. Windows, mailboxes and the
//! address exchange are shared through one [`LoopbackFabric`]. Since all
//! ranks share an address space, a window "address" is a real pointer and a
//! put is a copy. Copies into and out of window memory are done with atomic
//! word or byte accesses so ranks polling flag words never race with a
//! remote writer.
//!
//! This is a test fabric, not a production transport. Options allow
//! delaying completions and injecting failures.

use super::{Completion, InFlight, RmaRequest, RmaWindow, Transport};
use crate::error::{Result, RmaCollError};
use crate::types::{DataType, LockType, Rank, Tag};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::Poll;

/// Transport code: access outside of a lock or lock-all epoch.
pub const ERR_RMA_SYNC: i32 = 50;
/// Transport code: target range not covered by an attached region.
pub const ERR_RMA_RANGE: i32 = 55;
/// Transport code: incoming message longer than the posted receive.
pub const ERR_TRUNCATE: i32 = 15;

/// Kinds of issued operations, for counters and fault plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Put,
    Get,
    Send,
    Recv,
}

/// Fail the `nth` (1-based) operation of `kind` issued by `rank`.
///
/// The failing operation is accepted at issue time and reports
/// `OperationFailed` with `code` when polled. No data is moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub rank: Rank,
    pub kind: OpKind,
    pub nth: u64,
    pub code: i32,
}

#[derive(Debug, Clone, Default)]
pub struct LoopbackOptions {
    /// Number of polls every completion stays pending before finishing.
    pub completion_delay: u32,
    pub faults: Vec<Fault>,
}

/// Operations issued by one rank so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IssueCounts {
    pub puts: u64,
    pub gets: u64,
    pub sends: u64,
    pub recvs: u64,
    pub releases: u64,
}

struct Fabric {
    world: u32,
    options: LoopbackOptions,
    windows: Mutex<WindowTable>,
    mailboxes: Mutex<HashMap<(Rank, Rank, Tag), VecDeque<Vec<u8>>>>,
    exchange: Mutex<ExchangeTable>,
    exchange_cv: Condvar,
    issued: Mutex<Vec<IssueCounts>>,
}

struct WindowTable {
    windows: Vec<Arc<WindowShared>>,
    /// Per rank: index of the next window that rank will create.
    next: Vec<usize>,
}

struct ExchangeTable {
    next: Vec<usize>,
    rounds: HashMap<usize, ExchangeRound>,
}

struct ExchangeRound {
    inputs: Vec<Option<Vec<u64>>>,
    collected: u32,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Fabric {
    /// Count an issued operation and return the fault planned for it, if any.
    fn record_issue(&self, rank: Rank, kind: OpKind) -> Option<i32> {
        let mut issued = lock(&self.issued);
        let counts = &mut issued[rank as usize];
        let n = match kind {
            OpKind::Put => {
                counts.puts += 1;
                counts.puts
            }
            OpKind::Get => {
                counts.gets += 1;
                counts.gets
            }
            OpKind::Send => {
                counts.sends += 1;
                counts.sends
            }
            OpKind::Recv => {
                counts.recvs += 1;
                counts.recvs
            }
        };
        self.options
            .faults
            .iter()
            .find(|f| f.rank == rank && f.kind == kind && f.nth == n)
            .map(|f| f.code)
    }

    fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank >= self.world {
            return Err(RmaCollError::InvalidRank {
                rank,
                world_size: self.world,
            });
        }
        Ok(())
    }
}

/// Shared state of N loopback ranks.
#[derive(Clone)]
pub struct LoopbackFabric {
    fabric: Arc<Fabric>,
}

impl LoopbackFabric {
    pub fn new(world: u32) -> Self {
        Self::with_options(world, LoopbackOptions::default())
    }

    pub fn with_options(world: u32, options: LoopbackOptions) -> Self {
        let n = world as usize;
        Self {
            fabric: Arc::new(Fabric {
                world,
                options,
                windows: Mutex::new(WindowTable {
                    windows: Vec::new(),
                    next: vec![0; n],
                }),
                mailboxes: Mutex::new(HashMap::new()),
                exchange: Mutex::new(ExchangeTable {
                    next: vec![0; n],
                    rounds: HashMap::new(),
                }),
                exchange_cv: Condvar::new(),
                issued: Mutex::new(vec![IssueCounts::default(); n]),
            }),
        }
    }

    pub fn world_size(&self) -> u32 {
        self.fabric.world
    }

    /// Transport endpoint of `rank`.
    pub fn transport(&self, rank: Rank) -> Result<Arc<LoopbackTransport>> {
        self.fabric.check_rank(rank)?;
        Ok(Arc::new(LoopbackTransport {
            rank,
            fabric: Arc::clone(&self.fabric),
        }))
    }

    /// One endpoint per rank, in rank order.
    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        (0..self.fabric.world)
            .map(|rank| {
                Arc::new(LoopbackTransport {
                    rank,
                    fabric: Arc::clone(&self.fabric),
                })
            })
            .collect()
    }

    /// Operations issued by `rank` so far.
    pub fn issued(&self, rank: Rank) -> IssueCounts {
        lock(&self.fabric.issued)
            .get(rank as usize)
            .copied()
            .unwrap_or_default()
    }
}

/// One rank's endpoint on a [`LoopbackFabric`].
pub struct LoopbackTransport {
    rank: Rank,
    fabric: Arc<Fabric>,
}

impl Transport for LoopbackTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.fabric.world
    }

    fn create_window(&self) -> Result<Arc<dyn RmaWindow>> {
        let mut table = lock(&self.fabric.windows);
        let idx = table.next[self.rank as usize];
        table.next[self.rank as usize] += 1;
        if idx == table.windows.len() {
            table
                .windows
                .push(Arc::new(WindowShared::new(idx, self.fabric.world)));
        }
        let shared = table
            .windows
            .get(idx)
            .cloned()
            .ok_or_else(|| RmaCollError::Window(format!("window {idx} out of sequence")))?;
        tracing::debug!(rank = self.rank, window = idx, "loopback window created");
        Ok(Arc::new(LoopbackWindow {
            rank: self.rank,
            shared,
            fabric: Arc::clone(&self.fabric),
        }))
    }

    unsafe fn isend(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        peer: Rank,
        tag: Tag,
    ) -> Result<InFlight> {
        self.fabric.check_rank(peer)?;
        let fault = self.fabric.record_issue(self.rank, OpKind::Send);
        let bytes = count * dtype.size_in_bytes();
        let failed = fault.map(|code| {
            RmaCollError::operation_failed("isend", peer, code, "injected fault")
        });
        if failed.is_none() {
            let mut payload = vec![0u8; bytes];
            unsafe { atomic_copy(ptr, payload.as_mut_ptr() as u64, bytes) };
            lock(&self.fabric.mailboxes)
                .entry((self.rank, peer, tag))
                .or_default()
                .push_back(payload);
        }
        Ok(Box::new(Transfer {
            remaining: self.fabric.options.completion_delay,
            copy: None,
            failed,
        }))
    }

    unsafe fn irecv(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        peer: Rank,
        tag: Tag,
    ) -> Result<InFlight> {
        self.fabric.check_rank(peer)?;
        let fault = self.fabric.record_issue(self.rank, OpKind::Recv);
        Ok(Box::new(RecvCompletion {
            fabric: Arc::clone(&self.fabric),
            key: (peer, self.rank, tag),
            dst: ptr,
            capacity: count * dtype.size_in_bytes(),
            remaining: self.fabric.options.completion_delay,
            failed: fault.map(|code| {
                RmaCollError::operation_failed("irecv", peer, code, "injected fault")
            }),
            done: false,
        }))
    }

    fn exchange(&self, values: &[u64]) -> Result<Vec<u64>> {
        let world = self.fabric.world as usize;
        if values.len() != world {
            return Err(RmaCollError::invalid(format!(
                "exchange needs {world} values, got {}",
                values.len()
            )));
        }
        let me = self.rank as usize;

        let mut table = lock(&self.fabric.exchange);
        let idx = table.next[me];
        table.next[me] += 1;
        table
            .rounds
            .entry(idx)
            .or_insert_with(|| ExchangeRound {
                inputs: vec![None; world],
                collected: 0,
            })
            .inputs[me] = Some(values.to_vec());
        self.fabric.exchange_cv.notify_all();

        while !table
            .rounds
            .get(&idx)
            .is_some_and(|r| r.inputs.iter().all(Option::is_some))
        {
            table = self
                .fabric
                .exchange_cv
                .wait(table)
                .unwrap_or_else(|e| e.into_inner());
        }

        let round = table
            .rounds
            .get_mut(&idx)
            .ok_or_else(|| RmaCollError::Window(format!("exchange {idx} vanished")))?;
        let out: Vec<u64> = round
            .inputs
            .iter()
            .map(|v| v.as_ref().map_or(0, |v| v[me]))
            .collect();
        round.collected += 1;
        if round.collected == self.fabric.world {
            table.rounds.remove(&idx);
        }
        Ok(out)
    }
}

#[derive(Default)]
struct LockSlot {
    exclusive: Option<Rank>,
    shared: Vec<Rank>,
}

impl LockSlot {
    fn held_by(&self, rank: Rank) -> bool {
        self.exclusive == Some(rank) || self.shared.contains(&rank)
    }
}

struct WindowState {
    /// Attached `(base, len)` regions per rank.
    regions: Vec<Vec<(u64, usize)>>,
    /// Per origin rank: inside a lock-all epoch.
    lock_all: Vec<bool>,
    /// Per target rank.
    locks: Vec<LockSlot>,
    /// Per rank: number of releases issued.
    releases: Vec<u64>,
}

struct WindowShared {
    id: usize,
    state: Mutex<WindowState>,
}

impl WindowShared {
    fn new(id: usize, world: u32) -> Self {
        let n = world as usize;
        Self {
            id,
            state: Mutex::new(WindowState {
                regions: vec![Vec::new(); n],
                lock_all: vec![false; n],
                locks: (0..n).map(|_| LockSlot::default()).collect(),
                releases: vec![0; n],
            }),
        }
    }
}

/// One rank's view of a loopback window.
pub struct LoopbackWindow {
    rank: Rank,
    shared: Arc<WindowShared>,
    fabric: Arc<Fabric>,
}

impl LoopbackWindow {
    fn issue(&self, req: &RmaRequest, kind: OpKind) -> Result<InFlight> {
        let operation = match kind {
            OpKind::Get => "rget",
            _ => "rput",
        };
        self.fabric.check_rank(req.target)?;
        let len = req.origin_bytes();
        if len != req.target_bytes() {
            return Err(RmaCollError::BufferSizeMismatch {
                expected: req.target_bytes(),
                actual: len,
            });
        }
        {
            let state = lock(&self.shared.state);
            let me = self.rank as usize;
            if !state.lock_all[me] && !state.locks[req.target as usize].held_by(self.rank) {
                return Err(RmaCollError::operation_failed(
                    operation,
                    req.target,
                    ERR_RMA_SYNC,
                    format!("window {} accessed outside an epoch", self.shared.id),
                ));
            }
            let covered = state.regions[req.target as usize]
                .iter()
                .any(|&(base, size)| {
                    req.target_disp >= base && req.target_disp + len as u64 <= base + size as u64
                });
            if len > 0 && !covered {
                return Err(RmaCollError::operation_failed(
                    operation,
                    req.target,
                    ERR_RMA_RANGE,
                    format!("{:#x}+{len} not attached", req.target_disp),
                ));
            }
        }

        let fault = self.fabric.record_issue(self.rank, kind);
        let (src, dst) = match kind {
            OpKind::Get => (req.target_disp, req.origin),
            _ => (req.origin, req.target_disp),
        };
        tracing::trace!(
            rank = self.rank,
            target = req.target,
            op = operation,
            len,
            "loopback rma issued"
        );
        Ok(Box::new(Transfer {
            remaining: self.fabric.options.completion_delay,
            copy: Some((src, dst, len)),
            failed: fault.map(|code| {
                RmaCollError::operation_failed(operation, req.target, code, "injected fault")
            }),
        }))
    }
}

impl RmaWindow for LoopbackWindow {
    unsafe fn attach(&self, base: u64, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        lock(&self.shared.state).regions[self.rank as usize].push((base, len));
        Ok(())
    }

    fn lock_all(&self) -> Result<()> {
        lock(&self.shared.state).lock_all[self.rank as usize] = true;
        Ok(())
    }

    fn unlock_all(&self) -> Result<()> {
        lock(&self.shared.state).lock_all[self.rank as usize] = false;
        Ok(())
    }

    fn try_lock(&self, lock_type: LockType, target: Rank, _assert: u32) -> Result<bool> {
        self.fabric.check_rank(target)?;
        let mut state = lock(&self.shared.state);
        let slot = &mut state.locks[target as usize];
        if slot.held_by(self.rank) {
            return Err(RmaCollError::Window(format!(
                "rank {} already holds a lock on {target}",
                self.rank
            )));
        }
        let granted = match lock_type {
            LockType::Exclusive => slot.exclusive.is_none() && slot.shared.is_empty(),
            LockType::Shared => slot.exclusive.is_none(),
        };
        if granted {
            match lock_type {
                LockType::Exclusive => slot.exclusive = Some(self.rank),
                LockType::Shared => slot.shared.push(self.rank),
            }
        }
        Ok(granted)
    }

    fn try_unlock(&self, target: Rank) -> Result<bool> {
        self.fabric.check_rank(target)?;
        let mut state = lock(&self.shared.state);
        let slot = &mut state.locks[target as usize];
        if slot.exclusive == Some(self.rank) {
            slot.exclusive = None;
        } else if let Some(pos) = slot.shared.iter().position(|&r| r == self.rank) {
            slot.shared.swap_remove(pos);
        } else {
            return Err(RmaCollError::Window(format!(
                "rank {} holds no lock on {target}",
                self.rank
            )));
        }
        Ok(true)
    }

    unsafe fn rput(&self, req: &RmaRequest) -> Result<InFlight> {
        self.issue(req, OpKind::Put)
    }

    unsafe fn rget(&self, req: &RmaRequest) -> Result<InFlight> {
        self.issue(req, OpKind::Get)
    }

    fn release(&self) -> Result<InFlight> {
        let generation = {
            let mut state = lock(&self.shared.state);
            state.releases[self.rank as usize] += 1;
            state.releases[self.rank as usize]
        };
        lock(&self.fabric.issued)[self.rank as usize].releases += 1;
        Ok(Box::new(ReleaseCompletion {
            shared: Arc::clone(&self.shared),
            generation,
            remaining: self.fabric.options.completion_delay,
        }))
    }
}

struct Transfer {
    remaining: u32,
    /// `(src, dst, len)`, performed on completion.
    copy: Option<(u64, u64, usize)>,
    failed: Option<RmaCollError>,
}

impl Completion for Transfer {
    fn poll_complete(&mut self) -> Poll<Result<()>> {
        if self.remaining > 0 {
            self.remaining -= 1;
            return Poll::Pending;
        }
        if let Some(e) = &self.failed {
            return Poll::Ready(Err(e.clone()));
        }
        if let Some((src, dst, len)) = self.copy.take() {
            // SAFETY: validity of both ranges was promised by the issuer of
            // the rput/rget and checked against the attached regions.
            unsafe { atomic_copy(src, dst, len) };
        }
        Poll::Ready(Ok(()))
    }
}

struct RecvCompletion {
    fabric: Arc<Fabric>,
    key: (Rank, Rank, Tag),
    dst: u64,
    capacity: usize,
    remaining: u32,
    failed: Option<RmaCollError>,
    done: bool,
}

impl Completion for RecvCompletion {
    fn poll_complete(&mut self) -> Poll<Result<()>> {
        if self.done {
            return Poll::Ready(Ok(()));
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            return Poll::Pending;
        }
        if let Some(e) = &self.failed {
            return Poll::Ready(Err(e.clone()));
        }
        let msg = match lock(&self.fabric.mailboxes)
            .get_mut(&self.key)
            .and_then(VecDeque::pop_front)
        {
            Some(msg) => msg,
            None => return Poll::Pending,
        };
        if msg.len() > self.capacity {
            let e = RmaCollError::operation_failed(
                "irecv",
                self.key.0,
                ERR_TRUNCATE,
                format!("{} byte message into {} byte buffer", msg.len(), self.capacity),
            );
            self.failed = Some(e.clone());
            return Poll::Ready(Err(e));
        }
        // SAFETY: the receiver promised `dst` is writable for `capacity` bytes.
        unsafe { atomic_copy(msg.as_ptr() as u64, self.dst, msg.len()) };
        self.done = true;
        Poll::Ready(Ok(()))
    }
}

struct ReleaseCompletion {
    shared: Arc<WindowShared>,
    generation: u64,
    remaining: u32,
}

impl Completion for ReleaseCompletion {
    fn poll_complete(&mut self) -> Poll<Result<()>> {
        if self.remaining > 0 {
            self.remaining -= 1;
            return Poll::Pending;
        }
        let state = lock(&self.shared.state);
        if state.releases.iter().all(|&g| g >= self.generation) {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}

/// Copy `len` bytes with atomic accesses: whole words when both ends and the
/// length are word-aligned, bytes otherwise.
///
/// # Safety
/// `src` must be valid for reads and `dst` for writes of `len` bytes, and both
/// must only be accessed atomically by other threads for the duration.
unsafe fn atomic_copy(src: u64, dst: u64, len: usize) {
    if len == 0 || src == dst {
        return;
    }
    if src % 8 == 0 && dst % 8 == 0 && len % 8 == 0 {
        for i in 0..len / 8 {
            let (s, d) = unsafe {
                (
                    AtomicU64::from_ptr((src as *mut u64).add(i)),
                    AtomicU64::from_ptr((dst as *mut u64).add(i)),
                )
            };
            d.store(s.load(Ordering::Acquire), Ordering::Release);
        }
    } else {
        for i in 0..len {
            let (s, d) = unsafe {
                (
                    AtomicU8::from_ptr((src as *mut u8).add(i)),
                    AtomicU8::from_ptr((dst as *mut u8).add(i)),
                )
            };
            d.store(s.load(Ordering::Acquire), Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll_until_done(op: &mut InFlight) -> Result<()> {
        for _ in 0..1000 {
            if let Poll::Ready(r) = op.poll_complete() {
                return r;
            }
        }
        panic!("operation never completed");
    }

    #[test]
    fn test_put_requires_epoch_and_range() {
        let fabric = LoopbackFabric::new(2);
        let t = fabric.transports();
        let w0 = t[0].create_window().unwrap();
        let w1 = t[1].create_window().unwrap();

        let src = [7u64; 2];
        let mut dst = [0u64; 2];
        unsafe { w1.attach(dst.as_mut_ptr() as u64, 16).unwrap() };
        let req = RmaRequest {
            origin: src.as_ptr() as u64,
            origin_count: 2,
            origin_dtype: DataType::U64,
            target: 1,
            target_disp: dst.as_ptr() as u64,
            target_count: 2,
            target_dtype: DataType::U64,
        };

        let err = unsafe { w0.rput(&req) }.err().unwrap();
        assert_eq!(err.code(), ERR_RMA_SYNC);

        w0.lock_all().unwrap();
        let out_of_range = RmaRequest {
            target_disp: req.target_disp + 8,
            ..req
        };
        let err = unsafe { w0.rput(&out_of_range) }.err().unwrap();
        assert_eq!(err.code(), ERR_RMA_RANGE);

        let mut op = unsafe { w0.rput(&req) }.unwrap();
        poll_until_done(&mut op).unwrap();
        assert_eq!(dst, [7, 7]);
        assert_eq!(fabric.issued(0).puts, 1);
    }

    #[test]
    fn test_completion_delay_and_fault() {
        let fabric = LoopbackFabric::with_options(
            1,
            LoopbackOptions {
                completion_delay: 2,
                faults: vec![Fault {
                    rank: 0,
                    kind: OpKind::Get,
                    nth: 2,
                    code: 99,
                }],
            },
        );
        let t = fabric.transport(0).unwrap();
        let w = t.create_window().unwrap();
        let src = [1u8, 2, 3];
        let mut dst = [0u8; 3];
        unsafe { w.attach(src.as_ptr() as u64, 3).unwrap() };
        w.lock_all().unwrap();
        let req = RmaRequest {
            origin: dst.as_mut_ptr() as u64,
            origin_count: 3,
            origin_dtype: DataType::U8,
            target: 0,
            target_disp: src.as_ptr() as u64,
            target_count: 3,
            target_dtype: DataType::U8,
        };

        let mut first = unsafe { w.rget(&req) }.unwrap();
        assert!(first.poll_complete().is_pending());
        assert!(first.poll_complete().is_pending());
        assert_eq!(first.poll_complete(), Poll::Ready(Ok(())));
        assert_eq!(dst, [1, 2, 3]);

        dst = [0; 3];
        let mut second = unsafe { w.rget(&req) }.unwrap();
        let err = poll_until_done(&mut second).unwrap_err();
        assert_eq!(err.code(), 99);
        assert_eq!(dst, [0, 0, 0]);
    }

    #[test]
    fn test_lock_modes() {
        let fabric = LoopbackFabric::new(3);
        let t = fabric.transports();
        let w: Vec<_> = t.iter().map(|t| t.create_window().unwrap()).collect();

        assert!(w[0].try_lock(LockType::Shared, 2, 0).unwrap());
        assert!(w[1].try_lock(LockType::Shared, 2, 0).unwrap());
        assert!(!w[2].try_lock(LockType::Exclusive, 2, 0).unwrap());
        assert!(w[0].try_unlock(2).unwrap());
        assert!(w[1].try_unlock(2).unwrap());
        assert!(w[2].try_lock(LockType::Exclusive, 2, 0).unwrap());
        assert!(!w[0].try_lock(LockType::Shared, 2, 0).unwrap());
        assert!(w[0].try_unlock(2).is_err());
    }

    #[test]
    fn test_send_recv_and_truncation() {
        let fabric = LoopbackFabric::new(2);
        let t = fabric.transports();
        let data = [5u32, 6];
        let mut out = [0u32; 2];
        let mut short = [0u32; 1];

        let mut recv = unsafe { t[1].irecv(out.as_mut_ptr() as u64, 2, DataType::U32, 0, -30) }
            .unwrap();
        assert!(recv.poll_complete().is_pending());
        let mut send = unsafe { t[0].isend(data.as_ptr() as u64, 2, DataType::U32, 1, -30) }
            .unwrap();
        poll_until_done(&mut send).unwrap();
        poll_until_done(&mut recv).unwrap();
        assert_eq!(out, [5, 6]);

        let mut send = unsafe { t[0].isend(data.as_ptr() as u64, 2, DataType::U32, 1, -31) }
            .unwrap();
        poll_until_done(&mut send).unwrap();
        let mut recv =
            unsafe { t[1].irecv(short.as_mut_ptr() as u64, 1, DataType::U32, 0, -31) }.unwrap();
        assert_eq!(poll_until_done(&mut recv).unwrap_err().code(), ERR_TRUNCATE);
        assert_eq!(short, [0]);
    }

    #[test]
    fn test_exchange_across_threads() {
        let fabric = LoopbackFabric::new(4);
        let results: Vec<Vec<u64>> = std::thread::scope(|s| {
            let handles: Vec<_> = fabric
                .transports()
                .into_iter()
                .map(|t| {
                    s.spawn(move || {
                        let me = t.rank() as u64;
                        let values: Vec<u64> = (0..4).map(|j| me * 10 + j).collect();
                        t.exchange(&values).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (rank, got) in results.iter().enumerate() {
            let expected: Vec<u64> = (0..4).map(|j| j * 10 + rank as u64).collect();
            assert_eq!(got, &expected);
        }
    }

    #[test]
    fn test_release_waits_for_all_ranks() {
        let fabric = LoopbackFabric::new(2);
        let t = fabric.transports();
        let w0 = t[0].create_window().unwrap();
        let w1 = t[1].create_window().unwrap();
        let mut r0 = w0.release().unwrap();
        assert!(r0.poll_complete().is_pending());
        let mut r1 = w1.release().unwrap();
        assert!(r1.poll_complete().is_ready());
        assert!(r0.poll_complete().is_ready());
    }
}
