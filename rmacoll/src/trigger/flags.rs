use std::sync::atomic::{AtomicU64, Ordering};

/// Remotely writable flag words for one rank's trigger graph.
///
/// ```text
/// [0 .. N)    ready[peer]  written by `peer` during its phase 0
/// [N .. 2N)   done[peer]   written by `peer` during its phase 2
/// ```
///
/// The words are heap-allocated once and never move, so their address can
/// be attached to a window and handed to peers.
pub struct FlagArray {
    words: Box<[AtomicU64]>,
    world: u32,
}

impl FlagArray {
    pub fn new(world: u32) -> Self {
        let words = (0..2 * world as usize).map(|_| AtomicU64::new(0)).collect();
        Self { words, world }
    }

    /// Address of the first word.
    pub fn base_addr(&self) -> u64 {
        self.words.as_ptr() as u64
    }

    pub fn byte_len(&self) -> usize {
        self.words.len() * std::mem::size_of::<AtomicU64>()
    }

    pub fn ready_index(&self, peer: u32) -> usize {
        peer as usize
    }

    pub fn done_index(&self, peer: u32) -> usize {
        (self.world + peer) as usize
    }

    /// Address of `ready[me]` inside a peer's flag array based at `base`.
    pub fn remote_ready(base: u64, me: u32) -> u64 {
        base + 8 * me as u64
    }

    /// Address of `done[me]` inside a peer's flag array based at `base`.
    pub fn remote_done(base: u64, world: u32, me: u32) -> u64 {
        base + 8 * (world + me) as u64
    }

    pub fn load(&self, idx: usize) -> u64 {
        self.words.get(idx).map_or(0, |w| w.load(Ordering::Acquire))
    }

    pub fn store(&self, idx: usize, value: u64) {
        if let Some(w) = self.words.get(idx) {
            w.store(value, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for FlagArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let vals: Vec<u64> = (0..self.words.len()).map(|i| self.load(i)).collect();
        f.debug_struct("FlagArray")
            .field("world", &self.world)
            .field("words", &vals)
            .finish()
    }
}
