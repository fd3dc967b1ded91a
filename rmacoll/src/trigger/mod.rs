//! Trigger-graph execution: per-peer ready/done handshakes over one-sided
//! writes, completed by counting down a shared active counter.

mod flags;
mod graph;

pub use flags::FlagArray;
pub use graph::{
    Action, DECREMENTS_PER_PEER, Direction, GetAction, LocalCopy, PHASES, PeerBlock, PutAction,
    TickReport, Trigger, TriggerGraph, TriggerNode,
};
