//! Fixed-layout instruction records.
//!
//! Every record starts with a one-byte [`RecordTag`]; the tag alone determines
//! the record's encoded length. All multi-byte fields are little-endian.
//!
//! ```text
//! BufferLoc     = kind: u8 (0 user, 1 staging) + value: u64
//! Put / Get     = tag, loc, origin_count u32, origin_dtype u8,
//!                 target u32, target_count u32, target_dtype u8, target_disp u64
//! TryGet        = Get layout + lock_type u8 + assert u32
//! WindowRelease = tag
//! Reduce        = tag, src loc, dst loc, count u32, dtype u8, op u8
//! Copy          = tag, src loc, src_count u32, src_dtype u8,
//!                 dst loc, dst_count u32, dst_dtype u8
//! Unpack        = tag, src loc, count u32, dtype u8, dst loc
//! Send / Recv   = tag, loc, count u32, dtype u8, peer u32
//! ```

use crate::error::{Result, RmaCollError};
use crate::types::{DataType, LockType, Rank, ReduceOp};

const LOC_LEN: usize = 9;

/// Operation tag leading every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordTag {
    Put = 0,
    Get = 1,
    TryGet = 2,
    WindowRelease = 3,
    Reduce = 4,
    Copy = 5,
    Unpack = 6,
    Send = 7,
    Recv = 8,
}

impl RecordTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RecordTag::Put),
            1 => Some(RecordTag::Get),
            2 => Some(RecordTag::TryGet),
            3 => Some(RecordTag::WindowRelease),
            4 => Some(RecordTag::Reduce),
            5 => Some(RecordTag::Copy),
            6 => Some(RecordTag::Unpack),
            7 => Some(RecordTag::Send),
            8 => Some(RecordTag::Recv),
            _ => None,
        }
    }

    /// Encoded length of a record with this tag, tag byte included.
    pub const fn encoded_len(self) -> usize {
        match self {
            RecordTag::Put | RecordTag::Get => 1 + LOC_LEN + 4 + 1 + 4 + 4 + 1 + 8,
            RecordTag::TryGet => RecordTag::Get.encoded_len() + 1 + 4,
            RecordTag::WindowRelease => 1,
            RecordTag::Reduce => 1 + LOC_LEN + LOC_LEN + 4 + 1 + 1,
            RecordTag::Copy => 1 + LOC_LEN + 4 + 1 + LOC_LEN + 4 + 1,
            RecordTag::Unpack => 1 + LOC_LEN + 4 + 1 + LOC_LEN,
            RecordTag::Send | RecordTag::Recv => 1 + LOC_LEN + 4 + 1 + 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            RecordTag::Put => "put",
            RecordTag::Get => "get",
            RecordTag::TryGet => "try_get",
            RecordTag::WindowRelease => "window_release",
            RecordTag::Reduce => "reduce",
            RecordTag::Copy => "copy",
            RecordTag::Unpack => "unpack",
            RecordTag::Send => "send",
            RecordTag::Recv => "recv",
        }
    }
}

/// Where a record's buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferLoc {
    /// Absolute address in the caller's memory.
    User(u64),
    /// Byte offset into the owning request's staging buffer.
    Staging(u64),
}

impl BufferLoc {
    fn kind(self) -> u8 {
        match self {
            BufferLoc::User(_) => 0,
            BufferLoc::Staging(_) => 1,
        }
    }

    fn value(self) -> u64 {
        match self {
            BufferLoc::User(v) | BufferLoc::Staging(v) => v,
        }
    }
}

impl std::fmt::Display for BufferLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferLoc::User(p) => write!(f, "user:{p:#x}"),
            BufferLoc::Staging(o) => write!(f, "staging+{o}"),
        }
    }
}

/// Arguments of a one-sided `Put` or `Get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaArgs {
    pub origin: BufferLoc,
    pub origin_count: u32,
    pub origin_dtype: DataType,
    pub target: Rank,
    pub target_count: u32,
    pub target_dtype: DataType,
    /// Absolute address in the target's dynamic window.
    pub target_disp: u64,
}

/// Arguments of a `TryGet`: a get bracketed by a passive-target lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryGetArgs {
    pub get: RmaArgs,
    pub lock_type: LockType,
    pub assert: u32,
}

/// Arguments of a two-sided `Send` or `Recv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageArgs {
    pub buf: BufferLoc,
    pub count: u32,
    pub dtype: DataType,
    pub peer: Rank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceArgs {
    pub src: BufferLoc,
    pub dst: BufferLoc,
    pub count: u32,
    pub dtype: DataType,
    pub op: ReduceOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyArgs {
    pub src: BufferLoc,
    pub src_count: u32,
    pub src_dtype: DataType,
    pub dst: BufferLoc,
    pub dst_count: u32,
    pub dst_dtype: DataType,
}

/// Arguments of an `Unpack` from the external32 representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnpackArgs {
    pub src: BufferLoc,
    pub count: u32,
    pub dtype: DataType,
    pub dst: BufferLoc,
}

/// One decoded schedule record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Put(RmaArgs),
    Get(RmaArgs),
    TryGet(TryGetArgs),
    WindowRelease,
    Reduce(ReduceArgs),
    Copy(CopyArgs),
    Unpack(UnpackArgs),
    Send(MessageArgs),
    Recv(MessageArgs),
}

impl Instruction {
    pub fn tag(&self) -> RecordTag {
        match self {
            Instruction::Put(_) => RecordTag::Put,
            Instruction::Get(_) => RecordTag::Get,
            Instruction::TryGet(_) => RecordTag::TryGet,
            Instruction::WindowRelease => RecordTag::WindowRelease,
            Instruction::Reduce(_) => RecordTag::Reduce,
            Instruction::Copy(_) => RecordTag::Copy,
            Instruction::Unpack(_) => RecordTag::Unpack,
            Instruction::Send(_) => RecordTag::Send,
            Instruction::Recv(_) => RecordTag::Recv,
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.tag().encoded_len()
    }

    /// Append the encoded record to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.u8(self.tag() as u8);
        match self {
            Instruction::Put(a) | Instruction::Get(a) => w.rma(a),
            Instruction::TryGet(a) => {
                w.rma(&a.get);
                w.u8(a.lock_type as u8);
                w.u32(a.assert);
            }
            Instruction::WindowRelease => {}
            Instruction::Reduce(a) => {
                w.loc(a.src);
                w.loc(a.dst);
                w.u32(a.count);
                w.u8(a.dtype as u8);
                w.u8(a.op as u8);
            }
            Instruction::Copy(a) => {
                w.loc(a.src);
                w.u32(a.src_count);
                w.u8(a.src_dtype as u8);
                w.loc(a.dst);
                w.u32(a.dst_count);
                w.u8(a.dst_dtype as u8);
            }
            Instruction::Unpack(a) => {
                w.loc(a.src);
                w.u32(a.count);
                w.u8(a.dtype as u8);
                w.loc(a.dst);
            }
            Instruction::Send(a) | Instruction::Recv(a) => {
                w.loc(a.buf);
                w.u32(a.count);
                w.u8(a.dtype as u8);
                w.u32(a.peer);
            }
        }
    }

    /// Decode the record starting at `offset`.
    ///
    /// Any unknown tag or field byte, or a record running past the end of
    /// `bytes`, is `ScheduleCorrupt`.
    pub fn decode(bytes: &[u8], offset: usize) -> Result<Instruction> {
        let tag = peek_tag(bytes, offset)?;
        let end = offset + tag.encoded_len();
        if end > bytes.len() {
            return Err(RmaCollError::corrupt(
                offset,
                format!("{} record truncated", tag.name()),
            ));
        }
        let mut r = Reader {
            bytes,
            pos: offset + 1,
        };
        let instr = match tag {
            RecordTag::Put => Instruction::Put(r.rma()?),
            RecordTag::Get => Instruction::Get(r.rma()?),
            RecordTag::TryGet => {
                let get = r.rma()?;
                let at = r.pos;
                let lock_type = LockType::from_u8(r.u8())
                    .ok_or_else(|| RmaCollError::corrupt(at, "unknown lock type"))?;
                let assert = r.u32();
                Instruction::TryGet(TryGetArgs {
                    get,
                    lock_type,
                    assert,
                })
            }
            RecordTag::WindowRelease => Instruction::WindowRelease,
            RecordTag::Reduce => {
                let src = r.loc()?;
                let dst = r.loc()?;
                let count = r.u32();
                let dtype = r.dtype()?;
                let at = r.pos;
                let op = ReduceOp::from_u8(r.u8())
                    .ok_or_else(|| RmaCollError::corrupt(at, "unknown reduce op"))?;
                Instruction::Reduce(ReduceArgs {
                    src,
                    dst,
                    count,
                    dtype,
                    op,
                })
            }
            RecordTag::Copy => Instruction::Copy(CopyArgs {
                src: r.loc()?,
                src_count: r.u32(),
                src_dtype: r.dtype()?,
                dst: r.loc()?,
                dst_count: r.u32(),
                dst_dtype: r.dtype()?,
            }),
            RecordTag::Unpack => Instruction::Unpack(UnpackArgs {
                src: r.loc()?,
                count: r.u32(),
                dtype: r.dtype()?,
                dst: r.loc()?,
            }),
            RecordTag::Send => Instruction::Send(r.message()?),
            RecordTag::Recv => Instruction::Recv(r.message()?),
        };
        debug_assert_eq!(r.pos, end);
        Ok(instr)
    }
}

/// Read the tag byte of the record at `offset`.
pub(crate) fn peek_tag(bytes: &[u8], offset: usize) -> Result<RecordTag> {
    let byte = *bytes
        .get(offset)
        .ok_or_else(|| RmaCollError::corrupt(offset, "record tag past end of schedule"))?;
    RecordTag::from_u8(byte)
        .ok_or_else(|| RmaCollError::corrupt(offset, format!("unknown record tag {byte}")))
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::Put(a) | Instruction::Get(a) => write!(
                f,
                "{} origin={} {}x{} -> rank {} disp={:#x} {}x{}",
                self.tag().name(),
                a.origin,
                a.origin_count,
                a.origin_dtype,
                a.target,
                a.target_disp,
                a.target_count,
                a.target_dtype
            ),
            Instruction::TryGet(a) => write!(
                f,
                "try_get origin={} {}x{} <- rank {} disp={:#x} lock={:?} assert={:#x}",
                a.get.origin,
                a.get.origin_count,
                a.get.origin_dtype,
                a.get.target,
                a.get.target_disp,
                a.lock_type,
                a.assert
            ),
            Instruction::WindowRelease => f.write_str("window_release"),
            Instruction::Reduce(a) => write!(
                f,
                "reduce {} {} -> {} {}x{}",
                a.op, a.src, a.dst, a.count, a.dtype
            ),
            Instruction::Copy(a) => write!(
                f,
                "copy {} {}x{} -> {} {}x{}",
                a.src, a.src_count, a.src_dtype, a.dst, a.dst_count, a.dst_dtype
            ),
            Instruction::Unpack(a) => {
                write!(f, "unpack {} {}x{} -> {}", a.src, a.count, a.dtype, a.dst)
            }
            Instruction::Send(a) | Instruction::Recv(a) => write!(
                f,
                "{} {} {}x{} peer={}",
                self.tag().name(),
                a.buf,
                a.count,
                a.dtype,
                a.peer
            ),
        }
    }
}

struct Writer<'a>(&'a mut Vec<u8>);

impl Writer<'_> {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn loc(&mut self, loc: BufferLoc) {
        self.u8(loc.kind());
        self.u64(loc.value());
    }

    fn rma(&mut self, a: &RmaArgs) {
        self.loc(a.origin);
        self.u32(a.origin_count);
        self.u8(a.origin_dtype as u8);
        self.u32(a.target);
        self.u32(a.target_count);
        self.u8(a.target_dtype as u8);
        self.u64(a.target_disp);
    }
}

// Bounds are checked once against the tag's encoded length before reading.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u8(&mut self) -> u8 {
        let v = self.bytes[self.pos];
        self.pos += 1;
        v
    }

    fn u32(&mut self) -> u32 {
        let b = &self.bytes[self.pos..self.pos + 4];
        self.pos += 4;
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[self.pos..self.pos + 8]);
        self.pos += 8;
        u64::from_le_bytes(buf)
    }

    fn dtype(&mut self) -> Result<DataType> {
        let at = self.pos;
        let v = self.u8();
        DataType::from_u8(v)
            .ok_or_else(|| RmaCollError::corrupt(at, format!("unknown datatype {v}")))
    }

    fn loc(&mut self) -> Result<BufferLoc> {
        let at = self.pos;
        let kind = self.u8();
        let value = self.u64();
        match kind {
            0 => Ok(BufferLoc::User(value)),
            1 => Ok(BufferLoc::Staging(value)),
            k => Err(RmaCollError::corrupt(at, format!("unknown buffer kind {k}"))),
        }
    }

    fn rma(&mut self) -> Result<RmaArgs> {
        Ok(RmaArgs {
            origin: self.loc()?,
            origin_count: self.u32(),
            origin_dtype: self.dtype()?,
            target: self.u32(),
            target_count: self.u32(),
            target_dtype: self.dtype()?,
            target_disp: self.u64(),
        })
    }

    fn message(&mut self) -> Result<MessageArgs> {
        Ok(MessageArgs {
            buf: self.loc()?,
            count: self.u32(),
            dtype: self.dtype()?,
            peer: self.u32(),
        })
    }
}
