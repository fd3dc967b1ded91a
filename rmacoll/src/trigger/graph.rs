use super::flags::FlagArray;
use crate::error::{Result, RmaCollError};
use crate::transport::{InFlight, RmaRequest, RmaWindow};
use crate::types::{DataType, Rank};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Poll;

/// Number of handshake phases per peer.
pub const PHASES: usize = 6;
/// Counter decrements contributed by each remote peer (phases 3, 4, 5).
pub const DECREMENTS_PER_PEER: usize = 3;

/// Which side moves the data in phase 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Receiver reads the sender's block with a get.
    Pull,
    /// Sender writes its block into the receiver's buffer with a put.
    Push,
}

/// Condition that arms a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Satisfied at the start of every activation.
    Activation,
    /// Local flag word at this index has reached the activation epoch.
    FlagSet(usize),
    /// The operation in this slot has completed.
    OpComplete(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutAction {
    pub req: RmaRequest,
    pub slot: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetAction {
    pub req: RmaRequest,
    pub slot: usize,
}

/// What a node does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Put(PutAction),
    Get(GetAction),
    Decrement,
}

#[derive(Debug, Clone)]
pub struct TriggerNode {
    pub peer: Rank,
    pub phase: u8,
    pub trigger: Trigger,
    pub action: Action,
    fired: bool,
}

impl TriggerNode {
    pub fn fired(&self) -> bool {
        self.fired
    }
}

/// One peer's data block and the peer-side addresses matching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerBlock {
    pub peer: Rank,
    /// Local receive block (pull) or local send block (push).
    pub local: u64,
    pub local_count: usize,
    pub local_dtype: DataType,
    /// Absolute address of the matching block in `peer`'s memory.
    pub remote: u64,
    pub remote_count: usize,
    pub remote_dtype: DataType,
    /// Base address of `peer`'s [`FlagArray`].
    pub remote_flags: u64,
}

/// Local self-to-self data movement run when the graph is activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCopy {
    pub src: u64,
    pub dst: u64,
    pub bytes: usize,
}

/// Nodes fired by one [`TriggerGraph::tick`], as `(phase, peer)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fired: Vec<(u8, Rank)>,
}

enum Slot {
    Idle,
    Pending(InFlight),
    Done,
}

/// Ready/done handshake over one-sided writes.
///
/// Per remote peer, six nodes in phase-major order:
///
/// | phase | trigger               | action |
/// |-------|-----------------------|--------|
/// | 0     | activation            | put epoch into peer's `ready[me]` |
/// | 1     | `ready[peer]` set     | pull: get peer block; push: put my block |
/// | 2     | phase-1 op complete   | put epoch into peer's `done[me]` |
/// | 3     | phase-0 put complete  | decrement |
/// | 4     | phase-2 put complete  | decrement |
/// | 5     | `done[peer]` set      | decrement |
///
/// In pull mode `ready[me]` means "my send block for you is readable" and
/// `done[me]` means "I finished reading it". In push mode `ready[me]`
/// means "my receive block for you is writable" and `done[me]` means "my
/// block has landed in your buffer". The graph is complete when the active
/// counter reaches zero.
pub struct TriggerGraph {
    rank: Rank,
    world: u32,
    direction: Direction,
    window: Arc<dyn RmaWindow>,
    flags: FlagArray,
    /// Value written by flag puts. Boxed so its address is stable.
    epoch: Box<AtomicU64>,
    nodes: Vec<TriggerNode>,
    slots: Vec<Slot>,
    prologue: Vec<LocalCopy>,
    initial_active: usize,
    active: usize,
    failed: Option<RmaCollError>,
}

impl TriggerGraph {
    /// Build a pull graph.
    ///
    /// # Safety
    /// Every local and remote address in `blocks` and `prologue` must stay
    /// valid while the graph is active. Remote blocks and flag arrays must be
    /// attached to `window` by their owners, and `flags` must be attached by
    /// this rank.
    pub unsafe fn pull(
        rank: Rank,
        world: u32,
        window: Arc<dyn RmaWindow>,
        flags: FlagArray,
        blocks: Vec<PeerBlock>,
        prologue: Vec<LocalCopy>,
    ) -> Result<Self> {
        Self::build(Direction::Pull, rank, world, window, flags, blocks, prologue)
    }

    /// Build a push graph.
    ///
    /// # Safety
    /// Same contract as [`TriggerGraph::pull`].
    pub unsafe fn push(
        rank: Rank,
        world: u32,
        window: Arc<dyn RmaWindow>,
        flags: FlagArray,
        blocks: Vec<PeerBlock>,
        prologue: Vec<LocalCopy>,
    ) -> Result<Self> {
        Self::build(Direction::Push, rank, world, window, flags, blocks, prologue)
    }

    fn build(
        direction: Direction,
        rank: Rank,
        world: u32,
        window: Arc<dyn RmaWindow>,
        flags: FlagArray,
        blocks: Vec<PeerBlock>,
        prologue: Vec<LocalCopy>,
    ) -> Result<Self> {
        for b in &blocks {
            if b.peer >= world {
                return Err(RmaCollError::InvalidRank {
                    rank: b.peer,
                    world_size: world,
                });
            }
            if b.peer == rank {
                return Err(RmaCollError::invalid(
                    "self block belongs in the prologue, not the handshake",
                ));
            }
            if b.local_count * b.local_dtype.size_in_bytes()
                != b.remote_count * b.remote_dtype.size_in_bytes()
            {
                return Err(RmaCollError::BufferSizeMismatch {
                    expected: b.local_count * b.local_dtype.size_in_bytes(),
                    actual: b.remote_count * b.remote_dtype.size_in_bytes(),
                });
            }
        }

        let epoch = Box::new(AtomicU64::new(0));
        let epoch_addr = epoch.as_ptr() as u64;
        let npeers = blocks.len();
        let flag_put = |peer: Rank, disp: u64, slot: usize| {
            Action::Put(PutAction {
                req: RmaRequest {
                    origin: epoch_addr,
                    origin_count: 1,
                    origin_dtype: DataType::U64,
                    target: peer,
                    target_disp: disp,
                    target_count: 1,
                    target_dtype: DataType::U64,
                },
                slot,
            })
        };

        let mut nodes = Vec::with_capacity(PHASES * npeers);
        for phase in 0..PHASES as u8 {
            for (i, b) in blocks.iter().enumerate() {
                let ready_slot = 3 * i;
                let data_slot = 3 * i + 1;
                let done_slot = 3 * i + 2;
                let (trigger, action) = match phase {
                    0 => (
                        Trigger::Activation,
                        flag_put(b.peer, FlagArray::remote_ready(b.remote_flags, rank), ready_slot),
                    ),
                    1 => {
                        let req = RmaRequest {
                            origin: b.local,
                            origin_count: b.local_count,
                            origin_dtype: b.local_dtype,
                            target: b.peer,
                            target_disp: b.remote,
                            target_count: b.remote_count,
                            target_dtype: b.remote_dtype,
                        };
                        let action = match direction {
                            Direction::Pull => Action::Get(GetAction {
                                req,
                                slot: data_slot,
                            }),
                            Direction::Push => Action::Put(PutAction {
                                req,
                                slot: data_slot,
                            }),
                        };
                        (Trigger::FlagSet(flags.ready_index(b.peer)), action)
                    }
                    2 => (
                        Trigger::OpComplete(data_slot),
                        flag_put(
                            b.peer,
                            FlagArray::remote_done(b.remote_flags, world, rank),
                            done_slot,
                        ),
                    ),
                    3 => (Trigger::OpComplete(ready_slot), Action::Decrement),
                    4 => (Trigger::OpComplete(done_slot), Action::Decrement),
                    _ => (Trigger::FlagSet(flags.done_index(b.peer)), Action::Decrement),
                };
                nodes.push(TriggerNode {
                    peer: b.peer,
                    phase,
                    trigger,
                    action,
                    fired: false,
                });
            }
        }

        let initial_active = DECREMENTS_PER_PEER * npeers;
        tracing::debug!(
            rank,
            ?direction,
            peers = npeers,
            nodes = nodes.len(),
            active = initial_active,
            "trigger graph built"
        );
        Ok(Self {
            rank,
            world,
            direction,
            window,
            flags,
            epoch,
            nodes,
            slots: (0..3 * npeers).map(|_| Slot::Idle).collect(),
            prologue,
            initial_active,
            active: 0,
            failed: None,
        })
    }

    /// Arm the graph for a new activation and run the local prologue.
    ///
    /// Every activation bumps the epoch, so flags written in earlier
    /// activations never satisfy the new one.
    pub fn activate(&mut self) -> Result<()> {
        if self.slots.iter().any(|s| matches!(s, Slot::Pending(_))) {
            return Err(RmaCollError::RequestActive);
        }
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        for node in &mut self.nodes {
            node.fired = false;
        }
        for slot in &mut self.slots {
            *slot = Slot::Idle;
        }
        self.active = self.initial_active;
        self.failed = None;
        for copy in &self.prologue {
            // SAFETY: addresses were promised valid by the constructor's caller.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    copy.src as *const u8,
                    copy.dst as *mut u8,
                    copy.bytes,
                );
            }
        }
        tracing::debug!(rank = self.rank, epoch, active = self.active, "trigger graph activated");
        Ok(())
    }

    /// One pass over every node in phase-major order.
    ///
    /// A node fires at most once per activation, the first time its trigger
    /// is observed satisfied. An operation completing with an error fails the
    /// graph; the error is returned now and on every later tick.
    pub fn tick(&mut self) -> Result<TickReport> {
        if let Some(e) = &self.failed {
            return Err(e.clone());
        }
        let mut report = TickReport::default();
        let epoch = self.epoch.load(Ordering::Acquire);
        for i in 0..self.nodes.len() {
            if self.nodes[i].fired {
                continue;
            }
            let armed = match self.nodes[i].trigger {
                Trigger::Activation => true,
                Trigger::FlagSet(idx) => self.flags.load(idx) >= epoch,
                Trigger::OpComplete(slot) => match self.poll_slot(slot) {
                    Ok(done) => done,
                    Err(e) => return Err(self.fail(e)),
                },
            };
            if !armed {
                continue;
            }
            if let Err(e) = self.fire(i) {
                return Err(self.fail(e));
            }
            self.nodes[i].fired = true;
            report.fired.push((self.nodes[i].phase, self.nodes[i].peer));
            tracing::trace!(
                rank = self.rank,
                phase = self.nodes[i].phase,
                peer = self.nodes[i].peer,
                active = self.active,
                "trigger fired"
            );
        }
        Ok(report)
    }

    fn fire(&mut self, i: usize) -> Result<()> {
        match self.nodes[i].action {
            Action::Put(PutAction { req, slot }) => {
                // SAFETY: see the constructor contract.
                let op = unsafe { self.window.rput(&req)? };
                self.slots[slot] = Slot::Pending(op);
            }
            Action::Get(GetAction { req, slot }) => {
                let op = unsafe { self.window.rget(&req)? };
                self.slots[slot] = Slot::Pending(op);
            }
            Action::Decrement => {
                if self.active == 0 {
                    return Err(RmaCollError::corrupt(
                        i,
                        "trigger counter decremented below zero",
                    ));
                }
                self.active -= 1;
            }
        }
        Ok(())
    }

    fn poll_slot(&mut self, slot: usize) -> Result<bool> {
        let done = match &mut self.slots[slot] {
            Slot::Idle => false,
            Slot::Done => true,
            Slot::Pending(op) => match op.poll_complete() {
                Poll::Pending => false,
                Poll::Ready(Ok(())) => true,
                Poll::Ready(Err(e)) => return Err(e),
            },
        };
        if done {
            self.slots[slot] = Slot::Done;
        }
        Ok(done)
    }

    fn fail(&mut self, e: RmaCollError) -> RmaCollError {
        tracing::error!(rank = self.rank, error = %e, "trigger graph failed");
        // Abandon outstanding operations.
        for slot in &mut self.slots {
            *slot = Slot::Idle;
        }
        self.failed = Some(e.clone());
        e
    }

    /// Counter reached zero in the current activation.
    pub fn is_complete(&self) -> bool {
        self.failed.is_none() && self.active == 0 && self.epoch.load(Ordering::Acquire) > 0
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn initial_active(&self) -> usize {
        self.initial_active
    }

    pub fn nodes(&self) -> &[TriggerNode] {
        &self.nodes
    }

    pub fn flags(&self) -> &FlagArray {
        &self.flags
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn world_size(&self) -> u32 {
        self.world
    }
}

impl std::fmt::Debug for TriggerGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerGraph")
            .field("rank", &self.rank)
            .field("direction", &self.direction)
            .field("nodes", &self.nodes.len())
            .field("active", &self.active)
            .field("failed", &self.failed)
            .finish()
    }
}
