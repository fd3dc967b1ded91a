use super::record::{
    BufferLoc, CopyArgs, Instruction, MessageArgs, ReduceArgs, RmaArgs, TryGetArgs, UnpackArgs,
};
use super::scan::{self, COUNT_FIELD, FLAG_LAST, FLAG_MORE, SIZE_FIELD};
use crate::config::RmaCollConfig;
use crate::error::{Result, RmaCollError};
use crate::types::{DataType, LockType, Rank, ReduceOp};

/// Append-only byte-encoded list of rounds.
///
/// ```text
/// [u32 total_size] { [u32 record_count] record... [u8 continuation] }...
/// ```
///
/// The arena is extended in place by the builder methods and sealed by
/// [`Schedule::commit`], which writes the terminal `0` flag. Growth is
/// fallible: when the arena cannot grow, the call returns
/// `ResourceExhausted` and the schedule is left exactly as it was.
#[derive(Clone)]
pub struct Schedule {
    bytes: Vec<u8>,
    /// Offset of the count field of the round being built.
    current_round: usize,
    /// Offsets of every round's count field, in order.
    round_starts: Vec<usize>,
    committed: bool,
    max_bytes: usize,
}

impl Schedule {
    /// Create an empty schedule with one open round.
    pub fn new() -> Self {
        Self::with_config(&RmaCollConfig::default())
    }

    pub fn with_config(config: &RmaCollConfig) -> Self {
        let mut bytes = Vec::with_capacity(config.schedule_capacity.max(SIZE_FIELD + COUNT_FIELD + 1));
        bytes.extend_from_slice(&((SIZE_FIELD + COUNT_FIELD) as u32).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        Self {
            bytes,
            current_round: SIZE_FIELD,
            round_starts: vec![SIZE_FIELD],
            committed: false,
            max_bytes: config.max_schedule_bytes,
        }
    }

    /// Rebuild a committed schedule from its encoded form.
    ///
    /// The bytes are validated with the round scanner; any malformed round is
    /// `ScheduleCorrupt`.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let total = scan::read_u32(&bytes, 0)? as usize;
        if total != bytes.len() {
            return Err(RmaCollError::corrupt(
                0,
                format!("size field {total} does not match length {}", bytes.len()),
            ));
        }
        let mut round_starts = Vec::new();
        let mut end = SIZE_FIELD;
        for info in scan::rounds(&bytes) {
            let info = info?;
            // Records must decode, not just have known tags.
            scan::round_records(&bytes, info.offset)?;
            round_starts.push(info.offset);
            end = info.offset + info.size + 1;
        }
        if end != bytes.len() {
            return Err(RmaCollError::corrupt(end, "trailing bytes after last round"));
        }
        let current_round = round_starts.last().copied().unwrap_or(SIZE_FIELD);
        Ok(Self {
            max_bytes: bytes.len().max(RmaCollConfig::default().max_schedule_bytes),
            bytes,
            current_round,
            round_starts,
            committed: true,
        })
    }

    /// Append one record to the current round.
    ///
    /// With `close_round`, a barrier follows the record: the round is closed
    /// with a `1` flag and a new empty round is opened.
    pub fn append(&mut self, instr: Instruction, close_round: bool) -> Result<()> {
        let barrier = if close_round { 1 + COUNT_FIELD } else { 0 };
        self.grow(instr.encoded_len() + barrier)?;

        instr.encode_into(&mut self.bytes);
        let count = scan::read_u32(&self.bytes, self.current_round)? + 1;
        self.write_u32(self.current_round, count);
        if close_round {
            self.open_round();
        }
        self.sync_size();

        tracing::trace!(
            record = %instr,
            end = self.bytes.len(),
            round = self.round_starts.len() - 1,
            "schedule append"
        );
        Ok(())
    }

    /// Close the current round and open a new one.
    pub fn end_round(&mut self) -> Result<()> {
        self.grow(1 + COUNT_FIELD)?;
        self.open_round();
        self.sync_size();
        tracing::trace!(round = self.round_starts.len() - 1, "schedule barrier");
        Ok(())
    }

    /// Seal the schedule. No appends are accepted afterwards.
    pub fn commit(&mut self) -> Result<()> {
        self.grow(1)?;
        self.bytes.push(FLAG_LAST);
        self.sync_size();
        self.committed = true;
        tracing::trace!(
            size = self.bytes.len(),
            rounds = self.round_starts.len(),
            "schedule committed"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_put(
        &mut self,
        origin: BufferLoc,
        origin_count: u32,
        origin_dtype: DataType,
        target: Rank,
        target_count: u32,
        target_dtype: DataType,
        target_disp: u64,
    ) -> Result<()> {
        self.append(
            Instruction::Put(RmaArgs {
                origin,
                origin_count,
                origin_dtype,
                target,
                target_count,
                target_dtype,
                target_disp,
            }),
            false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_get(
        &mut self,
        origin: BufferLoc,
        origin_count: u32,
        origin_dtype: DataType,
        target: Rank,
        target_count: u32,
        target_dtype: DataType,
        target_disp: u64,
    ) -> Result<()> {
        self.append(
            Instruction::Get(RmaArgs {
                origin,
                origin_count,
                origin_dtype,
                target,
                target_count,
                target_dtype,
                target_disp,
            }),
            false,
        )
    }

    /// Append a get bracketed by a passive-target lock on `get.target`.
    pub fn append_try_get(&mut self, get: RmaArgs, lock_type: LockType, assert: u32) -> Result<()> {
        self.append(
            Instruction::TryGet(TryGetArgs {
                get,
                lock_type,
                assert,
            }),
            false,
        )
    }

    pub fn append_send(&mut self, buf: BufferLoc, count: u32, dtype: DataType, peer: Rank) -> Result<()> {
        self.append(
            Instruction::Send(MessageArgs {
                buf,
                count,
                dtype,
                peer,
            }),
            false,
        )
    }

    pub fn append_recv(&mut self, buf: BufferLoc, count: u32, dtype: DataType, peer: Rank) -> Result<()> {
        self.append(
            Instruction::Recv(MessageArgs {
                buf,
                count,
                dtype,
                peer,
            }),
            false,
        )
    }

    /// `dst = op(dst, src)` element-wise.
    pub fn append_reduce(
        &mut self,
        src: BufferLoc,
        dst: BufferLoc,
        count: u32,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        self.append(
            Instruction::Reduce(ReduceArgs {
                src,
                dst,
                count,
                dtype,
                op,
            }),
            false,
        )
    }

    pub fn append_copy(
        &mut self,
        src: BufferLoc,
        src_count: u32,
        src_dtype: DataType,
        dst: BufferLoc,
        dst_count: u32,
        dst_dtype: DataType,
    ) -> Result<()> {
        self.append(
            Instruction::Copy(CopyArgs {
                src,
                src_count,
                src_dtype,
                dst,
                dst_count,
                dst_dtype,
            }),
            false,
        )
    }

    pub fn append_unpack(
        &mut self,
        src: BufferLoc,
        count: u32,
        dtype: DataType,
        dst: BufferLoc,
    ) -> Result<()> {
        self.append(
            Instruction::Unpack(UnpackArgs {
                src,
                count,
                dtype,
                dst,
            }),
            false,
        )
    }

    pub fn append_window_release(&mut self) -> Result<()> {
        self.append(Instruction::WindowRelease, false)
    }

    /// The encoded schedule.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Offsets of every round's count field.
    pub fn round_offsets(&self) -> &[usize] {
        &self.round_starts
    }

    pub fn num_rounds(&self) -> usize {
        self.round_starts.len()
    }

    /// A committed schedule with a single empty round.
    pub fn is_noop(&self) -> bool {
        self.committed
            && self.round_starts.len() == 1
            && scan::read_u32(&self.bytes, SIZE_FIELD).is_ok_and(|c| c == 0)
            && self.bytes.get(SIZE_FIELD + COUNT_FIELD) == Some(&FLAG_LAST)
    }

    fn grow(&mut self, additional: usize) -> Result<()> {
        if self.committed {
            return Err(RmaCollError::ScheduleCommitted);
        }
        let new_len = self.bytes.len().checked_add(additional).ok_or_else(|| {
            RmaCollError::ResourceExhausted("schedule length overflow".into())
        })?;
        if new_len > self.max_bytes || new_len > u32::MAX as usize {
            return Err(RmaCollError::ResourceExhausted(format!(
                "schedule would grow to {new_len} bytes (limit {})",
                self.max_bytes
            )));
        }
        self.bytes.try_reserve(additional).map_err(|e| {
            RmaCollError::ResourceExhausted(format!("schedule growth by {additional} bytes: {e}"))
        })
    }

    fn open_round(&mut self) {
        self.bytes.push(FLAG_MORE);
        self.current_round = self.bytes.len();
        self.round_starts.push(self.current_round);
        self.bytes.extend_from_slice(&0u32.to_le_bytes());
    }

    fn sync_size(&mut self) {
        let len = self.bytes.len() as u32;
        self.write_u32(0, len);
    }

    fn write_u32(&mut self, offset: usize, v: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedule")
            .field("len", &self.bytes.len())
            .field("rounds", &self.round_starts.len())
            .field("committed", &self.committed)
            .finish()
    }
}

/// Human-readable dump of every round and record.
impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "schedule: {} bytes, {} rounds", self.bytes.len(), self.round_starts.len())?;
        for (i, &offset) in self.round_starts.iter().enumerate() {
            let records = match scan::round_records(&self.bytes, offset) {
                Ok(r) => r,
                Err(e) => return writeln!(f, "  round {i} @{offset}: {e}"),
            };
            writeln!(f, "  round {i} @{offset}: {} records", records.len())?;
            for (pos, instr) in records {
                writeln!(f, "    @{pos}: {instr}")?;
            }
        }
        if !self.committed {
            writeln!(f, "  (open)")?;
        }
        Ok(())
    }
}
