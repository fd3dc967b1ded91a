//! Byte-encoded round schedules.
//!
//! A schedule is an ordered list of rounds separated by barriers. All
//! operations of one round are issued together; the next round starts only
//! after every operation of the current one has completed.

mod builder;
pub mod record;
pub mod scan;

pub use builder::Schedule;
pub use record::{
    BufferLoc, CopyArgs, Instruction, MessageArgs, RecordTag, ReduceArgs, RmaArgs, TryGetArgs,
    UnpackArgs,
};
pub use scan::{RoundInfo, round_size, rounds};
