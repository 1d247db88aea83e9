//! Delegator server functionality modules.

mod appconfig;
mod delegator;
mod external;
mod fsyncer;
mod index;
mod reqmgr;
mod resolver;
mod slice;
mod store;
mod svcmgr;
mod transport;

use serde::{Deserialize, Serialize};

use crate::common::{ReplyHeader, ThreadId};

pub use appconfig::{AppConfig, AppRegistry, ClientSlot, MountInfo};
pub use delegator::{log_level_filter, Delegator, DelegatorConfig};
pub use external::{conn_id, ApiReply, ApiRequest, ConnId};
pub use index::{AttrIndex, ExtentIndex, ExtentKey, ExtentVal};
pub use resolver::SendDesc;
pub use slice::SliceRouter;
pub use store::{KvCall, KvDone};

/// Messages exchanged between delegators: the KV plane carrying index
/// operations to their owning ranks, and the data plane carrying fetch
/// batches and their replies.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum PeerMsg {
    /// KV operation for the receiving rank's shard.
    Kv { seq: u64, call: KvCall },

    /// Result of a forwarded KV operation.
    KvReply { seq: u64, done: KvDone },

    /// Batch of fetch work items for the receiving rank's service manager.
    Fetch { descs: Vec<SendDesc> },

    /// One fetch reply: header plus data bytes, routed to the request
    /// manager identified by `thrd`.
    FetchReply {
        thrd: ThreadId,
        hdr: ReplyHeader,
        data: Vec<u8>,
    },
}
