//! Public interface to the StageFS core library, linked by the delegator
//! server executable and by client applications.
//!
//! StageFS is a user-level distributed burst-buffer file system: clients
//! write log-structured data into per-process shared-memory superblocks
//! (spilling to node-local files when full), a per-node delegator promotes
//! write extents into a range-partitioned distributed index at fsync, and
//! reads are resolved against that index and serviced by batched
//! delegator-to-delegator fetches.

#[macro_use]
pub mod utils;

pub mod common;

pub mod client;
pub mod server;

pub use common::{
    errcode, AppId, ClientId, FileAttr, Fid, Gfid, SegTree, ServerRank,
};
pub use utils::StagefsError;

pub use client::{ClientConfig, ReadReply, ReadResult, StagefsClient};
pub use server::{log_level_filter, Delegator, DelegatorConfig};
