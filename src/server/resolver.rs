//! Read resolution: translating a client's staged read requests into
//! send-descriptors against the distributed extent index.
//!
//! One resolver runs per read RPC (stateless, reentrant). It decodes the
//! request tuples from the client's request region, probes the extent
//! index with two keys per tuple, and clips every returned extent to the
//! requested range, yielding one fetch work item per covered piece. Bytes
//! the index does not cover simply produce no descriptor and surface as a
//! short read at the client.

use serde::{Deserialize, Serialize};

use crate::common::{
    errcode, AppId, ClientId, Fid, ReadRequest, ServerRank, ThreadId,
    layout::{READ_REQ_LEN, REPLY_HDR_LEN},
};
use crate::server::appconfig::AppRegistry;
use crate::server::index::ExtentIndex;
use crate::utils::StagefsError;

/// One fetch work item: which bytes of which log to read (`dest_*`) and the
/// return address of the requesting side (`src_*`).
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct SendDesc {
    /// App id of the log file holding the data.
    pub dest_app_id: AppId,
    /// Client id of the log file holding the data.
    pub dest_client_id: ClientId,
    /// Delegator rank hosting the log file.
    pub dest_delegator: ServerRank,
    /// Physical offset of the piece within the log.
    pub dest_offset: u64,

    /// Number of bytes to be read.
    pub length: u64,

    /// Delegator rank of the request manager awaiting the reply.
    pub src_delegator: ServerRank,
    /// App id of the requesting client process.
    pub src_app_id: AppId,
    /// Client id of the requesting client process.
    pub src_client_id: ClientId,
    /// Request-manager thread id the reply routes back to.
    pub src_thrd: ThreadId,
    /// Rank of the application process making the request.
    pub src_dbg_rank: i32,

    /// Global file id of the requested range.
    pub src_fid: Fid,
    /// Logical file offset of this piece.
    pub src_offset: u64,
}

/// Outcome of resolving one read RPC.
pub(crate) struct Resolution {
    pub descs: Vec<SendDesc>,
    pub errcode: i32,
}

/// Resolves the `req_cnt` read requests staged in the client's request
/// region into clipped send-descriptors. Descriptor order is request order,
/// then ascending extent key within each request.
pub(crate) async fn resolve_read(
    me: ServerRank,
    registry: &AppRegistry,
    extents: &ExtentIndex,
    app_id: AppId,
    client_id: ClientId,
    req_cnt: u32,
    thrd_id: ThreadId,
) -> Result<Resolution, StagefsError> {
    let Some((app, slot)) = registry.client(app_id, client_id) else {
        return logged_err!(me; "read from unmounted app {} client {}",
                           app_id, client_id);
    };

    // the count word of the request region must agree with the RPC
    let staged = slot.req_buf.read_u64(0)? as u32;
    if staged != req_cnt {
        pf_warn!(me; "request count mismatch: rpc {} vs region {}",
                 req_cnt, staged);
    }
    let req_cnt = req_cnt.min(staged) as usize;
    if 8 + req_cnt * READ_REQ_LEN > app.req_buf_sz {
        return Ok(Resolution {
            descs: vec![],
            errcode: errcode::BAD_REQUEST,
        });
    }

    let mut reqs = Vec::with_capacity(req_cnt);
    let mut rec = [0u8; READ_REQ_LEN];
    for i in 0..req_cnt {
        slot.req_buf.read_at(8 + i * READ_REQ_LEN, &mut rec)?;
        let req = ReadRequest::decode(&rec)?;
        if req.length == 0 {
            return Ok(Resolution {
                descs: vec![],
                errcode: errcode::BAD_REQUEST,
            });
        }
        reqs.push(req);
    }

    // two probe keys per request bound the closed range
    let ranges: Vec<(Fid, u64, u64)> = reqs
        .iter()
        .map(|r| (r.fid, r.offset, r.offset + r.length - 1))
        .collect();
    let (pairs, kv_err) = extents.range_get(&ranges).await;

    let mut descs = vec![];
    for req in &reqs {
        let req_end = req.offset + req.length - 1;
        for (key, val) in &pairs {
            if key.fid != req.fid || val.len == 0 {
                continue;
            }
            let ext_end = key.offset + val.len - 1;
            if key.offset > req_end || ext_end < req.offset {
                continue;
            }
            // clip the stored extent to the requested range
            let clip_start = key.offset.max(req.offset);
            let clip_end = ext_end.min(req_end);
            descs.push(SendDesc {
                dest_app_id: val.app_id,
                dest_client_id: val.client_rank,
                dest_delegator: val.delegator,
                dest_offset: val.addr + (clip_start - key.offset),
                length: clip_end - clip_start + 1,
                src_delegator: me,
                src_app_id: app_id,
                src_client_id: client_id,
                src_thrd: thrd_id,
                src_dbg_rank: slot.dbg_rank,
                src_fid: key.fid,
                src_offset: clip_start,
            });
        }
    }

    // every descriptor claims a (header + data) slot in the reply region
    let need: usize = 8
        + descs
            .iter()
            .map(|d| REPLY_HDR_LEN + d.length as usize)
            .sum::<usize>();
    if need > app.recv_buf_sz {
        pf_warn!(me; "reply region too small: need {} have {}", need,
                 app.recv_buf_sz);
        return Ok(Resolution {
            descs: vec![],
            errcode: errcode::NO_MEM,
        });
    }

    Ok(Resolution {
        descs,
        errcode: kv_err,
    })
}
