use super::AlltoallvAlgorithm;
use crate::comm::CommContext;
use crate::datatype;
use crate::error::{Result, RmaCollError};
use crate::request::CollectiveRequest;
use crate::schedule::{BufferLoc, Instruction, Schedule};
use crate::trigger::{FlagArray, LocalCopy, PeerBlock, TriggerGraph};
use crate::types::{DataType, Rank};
use std::sync::Arc;

/// One side of an all-to-all-variable exchange.
///
/// Block `r` starts `displs[r]` elements after `ptr` and holds `counts[r]`
/// elements of `dtype`. On the send side it is what this rank sends to `r`;
/// on the receive side it is where data from `r` lands.
#[derive(Debug, Clone, Copy)]
pub struct AlltoallvBuffer<'a> {
    pub ptr: u64,
    pub counts: &'a [usize],
    pub displs: &'a [usize],
    pub dtype: DataType,
}

impl AlltoallvBuffer<'_> {
    fn block(&self, r: usize) -> u64 {
        self.ptr + datatype::extent(self.dtype, self.displs[r]) as u64
    }

    fn block_bytes(&self, r: usize) -> usize {
        datatype::extent(self.dtype, self.counts[r])
    }

    /// Element count of block `r` as carried by a schedule record.
    fn count(&self, r: usize) -> Result<u32> {
        u32::try_from(self.counts[r]).map_err(|_| {
            RmaCollError::invalid(format!(
                "block count {} for rank {r} exceeds {}",
                self.counts[r],
                u32::MAX
            ))
        })
    }

    fn validate(&self, world: usize, side: &str) -> Result<()> {
        if self.counts.len() != world || self.displs.len() != world {
            return Err(RmaCollError::invalid(format!(
                "{side} counts/displacements need {world} entries, got {}/{}",
                self.counts.len(),
                self.displs.len()
            )));
        }
        if self.ptr == 0 && self.counts.iter().any(|&c| c > 0) {
            return Err(RmaCollError::invalid(format!("null {side} buffer")));
        }
        for r in 0..world {
            self.count(r)?;
        }
        Ok(())
    }
}

/// Start a nonblocking all-to-all-variable using the configured algorithm.
///
/// Collective: every rank of the communicator must call it in the same
/// order. The returned request is already started.
///
/// # Safety
/// Every send block must stay readable and every receive block writable
/// until the request completes. Send and receive blocks must not overlap.
pub unsafe fn alltoallv(
    comm: &Arc<CommContext>,
    send: AlltoallvBuffer<'_>,
    recv: AlltoallvBuffer<'_>,
) -> Result<CollectiveRequest> {
    let algo = comm.config().a2av_algorithm;
    let req = unsafe { alltoallv_with(comm, send, recv, algo, false)? };
    req.start()?;
    Ok(req)
}

/// Build a persistent all-to-all-variable request. Not started.
///
/// # Safety
/// Same contract as [`alltoallv`], for as long as the request exists.
pub unsafe fn alltoallv_init(
    comm: &Arc<CommContext>,
    send: AlltoallvBuffer<'_>,
    recv: AlltoallvBuffer<'_>,
) -> Result<CollectiveRequest> {
    let algo = comm.config().a2av_algorithm;
    unsafe { alltoallv_with(comm, send, recv, algo, true) }
}

/// Build an all-to-all-variable request with an explicit algorithm.
///
/// Sets up the window (attach, address exchange, lock-all) collectively and
/// returns the request unstarted.
///
/// # Safety
/// Same contract as [`alltoallv`].
pub unsafe fn alltoallv_with(
    comm: &Arc<CommContext>,
    send: AlltoallvBuffer<'_>,
    recv: AlltoallvBuffer<'_>,
    algo: AlltoallvAlgorithm,
    persistent: bool,
) -> Result<CollectiveRequest> {
    let world = comm.world_size() as usize;
    let rank = comm.rank();
    if send.ptr != 0 && send.ptr == recv.ptr {
        tracing::warn!(rank, "in-place alltoallv is not supported");
        return Err(RmaCollError::invalid("in-place alltoallv is not supported"));
    }
    send.validate(world, "send")?;
    recv.validate(world, "recv")?;

    let transport = comm.transport();
    let window = transport.create_window()?;

    // Attach the blocks peers will access and swap their addresses.
    let exposed = if algo.exposes_send_buffer() { send } else { recv };
    let mut local_addrs = Vec::with_capacity(world);
    for r in 0..world {
        let addr = exposed.block(r);
        unsafe { window.attach(addr, exposed.block_bytes(r))? };
        local_addrs.push(addr);
    }
    let remote_addrs = transport.exchange(&local_addrs)?;

    tracing::debug!(
        rank,
        world,
        algorithm = %algo,
        persistent,
        "alltoallv setup"
    );

    match algo {
        AlltoallvAlgorithm::LinearPut | AlltoallvAlgorithm::LinearGet => {
            window.lock_all()?;
            let schedule =
                linear_schedule(comm, rank, &send, &recv, &remote_addrs, algo, persistent)?;
            unsafe { CollectiveRequest::from_schedule_with_window(comm, schedule, window, persistent) }
        }
        AlltoallvAlgorithm::TriggerPull | AlltoallvAlgorithm::TriggerPush => {
            let flags = FlagArray::new(world as u32);
            unsafe { window.attach(flags.base_addr(), flags.byte_len())? };
            let flag_bases = transport.exchange(&vec![flags.base_addr(); world])?;
            window.lock_all()?;

            let mut blocks = Vec::with_capacity(world.saturating_sub(1));
            for r in (0..world).filter(|&r| r != rank as usize) {
                blocks.push(peer_block(r, &send, &recv, &remote_addrs, flag_bases[r], algo));
            }
            let prologue = self_copy(rank as usize, &send, &recv)?
                .into_iter()
                .collect::<Vec<_>>();
            let win = Arc::clone(&window);
            let graph = unsafe {
                if algo == AlltoallvAlgorithm::TriggerPull {
                    TriggerGraph::pull(rank, world as u32, win, flags, blocks, prologue)?
                } else {
                    TriggerGraph::push(rank, world as u32, win, flags, blocks, prologue)?
                }
            };
            CollectiveRequest::from_trigger_graph(comm, graph, Some(window), persistent)
        }
    }
}

/// The self copy plus one put or get per peer with data, then a window
/// release.
///
/// Persistent schedules open with an extra release round: a peer's blocks
/// belong to the peer between activations, so nobody reads or writes them
/// until every rank has started the same activation.
fn linear_schedule(
    comm: &CommContext,
    rank: Rank,
    send: &AlltoallvBuffer<'_>,
    recv: &AlltoallvBuffer<'_>,
    remote_addrs: &[u64],
    algo: AlltoallvAlgorithm,
    persistent: bool,
) -> Result<Schedule> {
    let world = remote_addrs.len();
    let me = rank as usize;
    let mut schedule = Schedule::with_config(comm.config());
    if persistent {
        schedule.append(Instruction::WindowRelease, true)?;
    }

    if send.counts[me] != 0 {
        schedule.append_copy(
            BufferLoc::User(send.block(me)),
            send.count(me)?,
            send.dtype,
            BufferLoc::User(recv.block(me)),
            recv.count(me)?,
            recv.dtype,
        )?;
    }

    // Start at distance 1 so every rank targets a different peer first.
    for dist in 1..world {
        let peer = (me + dist) % world;
        match algo {
            AlltoallvAlgorithm::LinearGet if recv.counts[peer] != 0 => {
                schedule.append_get(
                    BufferLoc::User(recv.block(peer)),
                    recv.count(peer)?,
                    recv.dtype,
                    peer as Rank,
                    recv.count(peer)?,
                    recv.dtype,
                    remote_addrs[peer],
                )?;
            }
            AlltoallvAlgorithm::LinearPut if send.counts[peer] != 0 => {
                schedule.append_put(
                    BufferLoc::User(send.block(peer)),
                    send.count(peer)?,
                    send.dtype,
                    peer as Rank,
                    send.count(peer)?,
                    send.dtype,
                    remote_addrs[peer],
                )?;
            }
            _ => {}
        }
    }
    schedule.end_round()?;
    schedule.append_window_release()?;
    schedule.commit()?;
    tracing::trace!(rank, "alltoallv schedule:\n{schedule}");
    Ok(schedule)
}

fn peer_block(
    peer: usize,
    send: &AlltoallvBuffer<'_>,
    recv: &AlltoallvBuffer<'_>,
    remote_addrs: &[u64],
    remote_flags: u64,
    algo: AlltoallvAlgorithm,
) -> PeerBlock {
    // Pull reads the peer's send block into our receive block; push writes
    // our send block into the peer's receive block.
    let (local, side) = if algo == AlltoallvAlgorithm::TriggerPull {
        (recv.block(peer), recv)
    } else {
        (send.block(peer), send)
    };
    PeerBlock {
        peer: peer as Rank,
        local,
        local_count: side.counts[peer],
        local_dtype: side.dtype,
        remote: remote_addrs[peer],
        remote_count: side.counts[peer],
        remote_dtype: side.dtype,
        remote_flags,
    }
}

fn self_copy(
    me: usize,
    send: &AlltoallvBuffer<'_>,
    recv: &AlltoallvBuffer<'_>,
) -> Result<Option<LocalCopy>> {
    let bytes = send.block_bytes(me);
    if bytes == 0 {
        return Ok(None);
    }
    if recv.block_bytes(me) < bytes {
        return Err(RmaCollError::BufferSizeMismatch {
            expected: bytes,
            actual: recv.block_bytes(me),
        });
    }
    Ok(Some(LocalCopy {
        src: send.block(me),
        dst: recv.block(me),
        bytes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::RmaCollComponent;
    use crate::config::RmaCollConfig;
    use crate::transport::loopback::LoopbackFabric;

    fn comms(world: u32, algo: AlltoallvAlgorithm) -> Vec<Arc<CommContext>> {
        let fabric = LoopbackFabric::new(world);
        let component = RmaCollComponent::new(RmaCollConfig {
            a2av_algorithm: algo,
            ..RmaCollConfig::default()
        });
        fabric
            .transports()
            .into_iter()
            .map(|t| CommContext::new(t, Arc::clone(&component)))
            .collect()
    }

    #[test]
    fn test_in_place_is_rejected() {
        let comms = comms(1, AlltoallvAlgorithm::LinearPut);
        let mut buf = [0u32; 1];
        let b = AlltoallvBuffer {
            ptr: buf.as_mut_ptr() as u64,
            counts: &[1],
            displs: &[0],
            dtype: DataType::U32,
        };
        let err = unsafe { alltoallv(&comms[0], b, b) }.unwrap_err();
        assert!(matches!(err, RmaCollError::InvalidParameter(_)));
    }

    #[test]
    fn test_count_length_mismatch_is_rejected() {
        let comms = comms(2, AlltoallvAlgorithm::LinearGet);
        let src = [0u32; 2];
        let mut dst = [0u32; 2];
        let send = AlltoallvBuffer {
            ptr: src.as_ptr() as u64,
            counts: &[1],
            displs: &[0],
            dtype: DataType::U32,
        };
        let recv = AlltoallvBuffer {
            ptr: dst.as_mut_ptr() as u64,
            counts: &[1, 1],
            displs: &[0, 1],
            dtype: DataType::U32,
        };
        let err = unsafe { alltoallv(&comms[0], send, recv) }.unwrap_err();
        assert!(matches!(err, RmaCollError::InvalidParameter(_)));
    }

    #[test]
    fn test_single_rank_copies_locally() {
        for algo in [
            AlltoallvAlgorithm::LinearPut,
            AlltoallvAlgorithm::LinearGet,
            AlltoallvAlgorithm::TriggerPull,
            AlltoallvAlgorithm::TriggerPush,
        ] {
            let comms = comms(1, algo);
            let src = [11u16, 12, 13];
            let mut dst = [0u16; 3];
            let send = AlltoallvBuffer {
                ptr: src.as_ptr() as u64,
                counts: &[3],
                displs: &[0],
                dtype: DataType::BF16,
            };
            let recv = AlltoallvBuffer {
                ptr: dst.as_mut_ptr() as u64,
                counts: &[3],
                displs: &[0],
                dtype: DataType::BF16,
            };
            let req = unsafe { alltoallv(&comms[0], send, recv) }.unwrap();
            req.wait_blocking().unwrap();
            assert_eq!(dst, [11, 12, 13], "algorithm {algo}");
        }
    }

    #[test]
    fn test_linear_schedule_layout() {
        let comms = comms(3, AlltoallvAlgorithm::LinearPut);
        let src = [0u32; 3];
        let mut dst = [0u32; 3];
        let send = AlltoallvBuffer {
            ptr: src.as_ptr() as u64,
            counts: &[1, 0, 1],
            displs: &[0, 1, 2],
            dtype: DataType::U32,
        };
        let recv = AlltoallvBuffer {
            ptr: dst.as_mut_ptr() as u64,
            counts: &[1, 1, 1],
            displs: &[0, 1, 2],
            dtype: DataType::U32,
        };
        let remote = [0x1000, 0x2000, 0x3000];
        let s = linear_schedule(
            &comms[0],
            0,
            &send,
            &recv,
            &remote,
            AlltoallvAlgorithm::LinearPut,
            false,
        )
        .unwrap();
        assert_eq!(s.num_rounds(), 2);
        let round0 = crate::schedule::scan::round_records(s.as_bytes(), s.round_offsets()[0])
            .unwrap();
        // Self copy, then a put to rank 2 only: rank 1 gets nothing.
        assert_eq!(round0.len(), 2);
        let round1 = crate::schedule::scan::round_records(s.as_bytes(), s.round_offsets()[1])
            .unwrap();
        assert_eq!(round1.len(), 1);
    }

    #[test]
    fn test_persistent_linear_schedule_opens_with_release() {
        let comms = comms(2, AlltoallvAlgorithm::LinearGet);
        let src = [0u64; 2];
        let mut dst = [0u64; 2];
        let send = AlltoallvBuffer {
            ptr: src.as_ptr() as u64,
            counts: &[1, 1],
            displs: &[0, 1],
            dtype: DataType::U64,
        };
        let recv = AlltoallvBuffer {
            ptr: dst.as_mut_ptr() as u64,
            counts: &[1, 1],
            displs: &[0, 1],
            dtype: DataType::U64,
        };
        let s = linear_schedule(
            &comms[0],
            0,
            &send,
            &recv,
            &[0x1000, 0x2000],
            AlltoallvAlgorithm::LinearGet,
            true,
        )
        .unwrap();
        let rounds: Vec<Vec<Instruction>> = s
            .round_offsets()
            .iter()
            .map(|&o| {
                crate::schedule::scan::round_records(s.as_bytes(), o)
                    .unwrap()
                    .into_iter()
                    .map(|(_, i)| i)
                    .collect()
            })
            .collect();
        assert_eq!(rounds.len(), 3);
        assert_eq!(rounds[0], vec![Instruction::WindowRelease]);
        assert!(matches!(rounds[1][0], Instruction::Copy(_)));
        assert!(matches!(rounds[1][1], Instruction::Get(_)));
        assert_eq!(rounds[2], vec![Instruction::WindowRelease]);
    }

    #[test]
    fn test_count_beyond_record_range_is_rejected() {
        let comms = comms(1, AlltoallvAlgorithm::LinearPut);
        let src = [0u8; 1];
        let mut dst = [0u8; 1];
        let huge = [u32::MAX as usize + 1];
        let send = AlltoallvBuffer {
            ptr: src.as_ptr() as u64,
            counts: &huge,
            displs: &[0],
            dtype: DataType::U8,
        };
        let recv = AlltoallvBuffer {
            ptr: dst.as_mut_ptr() as u64,
            counts: &[1],
            displs: &[0],
            dtype: DataType::U8,
        };
        let err = unsafe { alltoallv(&comms[0], send, recv) }.unwrap_err();
        assert!(matches!(err, RmaCollError::InvalidParameter(_)), "{err:?}");
    }
}
