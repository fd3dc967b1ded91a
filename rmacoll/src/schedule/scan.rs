//! Pure walkers over an encoded schedule.
//!
//! A round at offset `o` is `u32 count` followed by `count` records and a
//! one-byte continuation flag (1 = another round follows, 0 = last round).
//! [`round_size`] counts the leading count field but not the flag.

use super::record::{Instruction, peek_tag};
use crate::error::{Result, RmaCollError};

/// Byte length of the schedule's leading size field.
pub const SIZE_FIELD: usize = 4;
/// Byte length of a round's record-count field.
pub const COUNT_FIELD: usize = 4;

pub(crate) const FLAG_LAST: u8 = 0;
pub(crate) const FLAG_MORE: u8 = 1;

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let b = bytes
        .get(offset..offset + 4)
        .ok_or_else(|| RmaCollError::corrupt(offset, "u32 field past end of schedule"))?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Length of the round starting at `offset`, count field included.
pub fn round_size(bytes: &[u8], offset: usize) -> Result<usize> {
    let count = read_u32(bytes, offset)?;
    let mut pos = offset + COUNT_FIELD;
    for _ in 0..count {
        let tag = peek_tag(bytes, pos)?;
        pos += tag.encoded_len();
    }
    if pos > bytes.len() {
        return Err(RmaCollError::corrupt(offset, "round runs past end of schedule"));
    }
    Ok(pos - offset)
}

/// Continuation flag of the round starting at `offset`.
pub fn continuation(bytes: &[u8], offset: usize) -> Result<bool> {
    let at = offset + round_size(bytes, offset)?;
    match bytes.get(at) {
        Some(&FLAG_LAST) => Ok(false),
        Some(&FLAG_MORE) => Ok(true),
        Some(&b) => Err(RmaCollError::corrupt(at, format!("bad round flag {b}"))),
        None => Err(RmaCollError::corrupt(at, "missing round flag")),
    }
}

/// One round as seen by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundInfo {
    /// Offset of the round's count field.
    pub offset: usize,
    pub records: u32,
    /// Same value as [`round_size`].
    pub size: usize,
    /// Whether another round follows.
    pub more: bool,
}

/// Iterate the rounds of a committed schedule, starting after the size field.
///
/// Stops after the first error.
pub fn rounds(bytes: &[u8]) -> Rounds<'_> {
    Rounds {
        bytes,
        next: Some(SIZE_FIELD),
    }
}

pub struct Rounds<'a> {
    bytes: &'a [u8],
    next: Option<usize>,
}

impl Iterator for Rounds<'_> {
    type Item = Result<RoundInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next.take()?;
        let info = round_info(self.bytes, offset);
        if let Ok(info) = &info
            && info.more
        {
            self.next = Some(offset + info.size + 1);
        }
        Some(info)
    }
}

/// Scanner view of the round starting at `offset`.
pub fn round_info(bytes: &[u8], offset: usize) -> Result<RoundInfo> {
    let records = read_u32(bytes, offset)?;
    let size = round_size(bytes, offset)?;
    let more = continuation(bytes, offset)?;
    Ok(RoundInfo {
        offset,
        records,
        size,
        more,
    })
}

/// Decode the records of the round starting at `offset`, in order.
pub fn round_records(bytes: &[u8], offset: usize) -> Result<Vec<(usize, Instruction)>> {
    let count = read_u32(bytes, offset)?;
    let mut out = Vec::with_capacity(count as usize);
    let mut pos = offset + COUNT_FIELD;
    for _ in 0..count {
        let instr = Instruction::decode(bytes, pos)?;
        out.push((pos, instr));
        pos += instr.encoded_len();
    }
    Ok(out)
}
