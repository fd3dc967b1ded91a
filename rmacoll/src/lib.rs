pub mod collective;
pub mod comm;
pub mod component;
pub mod config;
pub mod datatype;
pub mod error;
pub mod reduce;
pub mod request;
pub mod schedule;
pub mod transport;
pub mod trigger;
pub mod types;

pub use collective::{
    AlltoallvAlgorithm, AlltoallvBuffer, alltoallv, alltoallv_init, alltoallv_with,
};
pub use comm::CommContext;
pub use component::RmaCollComponent;
pub use config::RmaCollConfig;
pub use error::{Result, RmaCollError};
pub use request::{CollectiveRequest, Progress, RequestGroup, RequestState};
pub use schedule::{BufferLoc, Instruction, Schedule};
pub use transport::loopback::{LoopbackFabric, LoopbackOptions};
pub use transport::{Completion, InFlight, RmaWindow, Transport};
pub use trigger::TriggerGraph;
pub use types::{DataType, LockType, Rank, ReduceOp, Tag};
