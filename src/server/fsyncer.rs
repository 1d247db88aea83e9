//! Fsync handling: promoting a client's buffered extents and attributes
//! into the distributed indexes.
//!
//! One handler runs per fsync RPC (stateless, reentrant against the KV
//! plane). The client has already coalesced its writes through its segment
//! tree, so the records read out of the superblock carry no intra-batch
//! overlaps and are forwarded as-is.

use crate::common::{
    errcode, AppId, ClientId, FileAttr, IndexRecord, ServerRank,
    layout::{ATTR_REC_LEN, INDEX_REC_LEN},
};
use crate::server::appconfig::AppRegistry;
use crate::server::index::{AttrIndex, ExtentIndex, ExtentKey, ExtentVal};
use crate::utils::{page_size, StagefsError};

/// Runs the fsync procedure for one client; returns the wire error code
/// (OK, or the first error observed after draining both batches).
pub(crate) async fn process_fsync(
    me: ServerRank,
    registry: &AppRegistry,
    extents: &ExtentIndex,
    attrs: &AttrIndex,
    app_id: AppId,
    client_id: ClientId,
) -> i32 {
    match run_fsync(me, registry, extents, attrs, app_id, client_id).await {
        Ok(code) => code,
        Err(e) => {
            pf_error!(me; "fsync of app {} client {} failed: {}", app_id,
                      client_id, e);
            errcode::KV
        }
    }
}

async fn run_fsync(
    me: ServerRank,
    registry: &AppRegistry,
    extents: &ExtentIndex,
    attrs: &AttrIndex,
    app_id: AppId,
    client_id: ClientId,
) -> Result<i32, StagefsError> {
    let Some((app, slot)) = registry.client(app_id, client_id) else {
        pf_error!(me; "fsync from unmounted app {} client {}", app_id,
                  client_id);
        return Ok(errcode::BAD_REQUEST);
    };
    let page = page_size();
    let mut first_err = errcode::OK;

    // index records: count word at meta_offset, array one page after it
    let num_extents =
        slot.superblock.read_u64(app.layout.meta_offset)? as usize;
    if num_extents > app.layout.index_capacity(page) {
        pf_error!(me; "fsync index count {} exceeds region capacity",
                  num_extents);
        return Ok(errcode::BAD_REQUEST);
    }

    let mut pairs = Vec::with_capacity(num_extents);
    let mut rec = [0u8; INDEX_REC_LEN];
    for i in 0..num_extents {
        slot.superblock.read_at(
            app.layout.meta_offset + page + i * INDEX_REC_LEN,
            &mut rec,
        )?;
        let record = IndexRecord::decode(&rec)?;
        pairs.push((
            ExtentKey {
                fid: record.fid,
                offset: record.file_pos,
            },
            ExtentVal {
                addr: record.mem_pos,
                len: record.length,
                delegator: me,
                app_id,
                client_rank: client_id,
            },
        ));
    }

    pf_debug!(me; "fsync app {} client {}: {} extents", app_id, client_id,
              pairs.len());
    if !pairs.is_empty() {
        if let Err(e) = extents.batch_put(pairs).await {
            pf_error!(me; "extent batch put failed: {}", e);
            first_err = errcode::KV;
        }
    }

    // attribute records: same convention at fmeta_offset
    let num_attrs =
        slot.superblock.read_u64(app.layout.fmeta_offset)? as usize;
    if num_attrs > app.layout.attr_capacity(page) {
        pf_error!(me; "fsync attr count {} exceeds region capacity",
                  num_attrs);
        return Ok(if first_err != errcode::OK {
            first_err
        } else {
            errcode::BAD_REQUEST
        });
    }

    let mut attr_recs = Vec::with_capacity(num_attrs);
    let mut buf = vec![0u8; ATTR_REC_LEN];
    for i in 0..num_attrs {
        slot.superblock.read_at(
            app.layout.fmeta_offset + page + i * ATTR_REC_LEN,
            &mut buf,
        )?;
        attr_recs.push(FileAttr::decode(&buf)?);
    }

    if !attr_recs.is_empty() {
        if let Err(e) = attrs.batch_put(attr_recs).await {
            pf_error!(me; "attr batch put failed: {}", e);
            if first_err == errcode::OK {
                first_err = errcode::KV;
            }
        }
    }

    Ok(first_err)
}
