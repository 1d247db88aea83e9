//! Types shared between the client library and the delegator server.

pub mod layout;
pub mod segtree;

pub use layout::{
    errcode, AppId, ClientId, FileAttr, Fid, Gfid, IndexRecord, ReadRequest,
    ReplyHeader, ServerRank, SuperblockLayout, ThreadId,
};
pub use segtree::{SegTree, Segment};
