//! Distributed extent and file-attribute indexes.
//!
//! Two separately typed handles backed by the same shard fleet: extent keys
//! `(fid, offset)` map to the physical location of a write extent, and gfid
//! keys map to file attributes. Batches are partitioned across metadata
//! servers by the slice router; the local portion goes straight to this
//! rank's shard task and remote portions travel as `Kv` peer messages
//! matched back to callers by sequence number (the delegator event loop
//! feeds `KvReply` messages into `MetaCtx::complete`).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::common::{errcode, FileAttr, Fid, Gfid, ServerRank};
use crate::server::slice::SliceRouter;
use crate::server::store::{
    KvCall, KvDone, ShardClient, ATTR_INDEX_ID, EXTENT_INDEX_ID,
};
use crate::server::transport::TransportSender;
use crate::server::PeerMsg;
use crate::utils::StagefsError;

/// Extent key; encoded big-endian so byte order equals `(fid, offset)`
/// order in the shard's ordered map.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct ExtentKey {
    pub fid: Fid,
    pub offset: u64,
}

/// Byte width of an encoded extent key.
pub const EXTENT_KEY_LEN: usize = 16;
/// Byte width of an encoded extent value.
pub const EXTENT_VAL_LEN: usize = 28;

impl ExtentKey {
    pub fn encode(&self) -> [u8; EXTENT_KEY_LEN] {
        let mut out = [0u8; EXTENT_KEY_LEN];
        out[0..8].copy_from_slice(&self.fid.to_be_bytes());
        out[8..16].copy_from_slice(&self.offset.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, StagefsError> {
        if buf.len() < EXTENT_KEY_LEN {
            return Err(StagefsError::msg("extent key truncated"));
        }
        Ok(ExtentKey {
            fid: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            offset: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

/// Extent value: the physical location of `len` bytes, namely byte `addr`
/// of the data log of `(app_id, client_rank)` on server `delegator`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ExtentVal {
    pub addr: u64,
    pub len: u64,
    pub delegator: ServerRank,
    pub app_id: u32,
    pub client_rank: u32,
}

impl ExtentVal {
    pub fn encode(&self) -> [u8; EXTENT_VAL_LEN] {
        let mut out = [0u8; EXTENT_VAL_LEN];
        out[0..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..16].copy_from_slice(&self.len.to_le_bytes());
        out[16..20].copy_from_slice(&self.delegator.to_le_bytes());
        out[20..24].copy_from_slice(&self.app_id.to_le_bytes());
        out[24..28].copy_from_slice(&self.client_rank.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, StagefsError> {
        if buf.len() < EXTENT_VAL_LEN {
            return Err(StagefsError::msg("extent value truncated"));
        }
        Ok(ExtentVal {
            addr: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            len: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            delegator: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            app_id: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            client_rank: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
        })
    }
}

fn attr_key(gfid: Gfid) -> Vec<u8> {
    (gfid as u32).to_be_bytes().to_vec()
}

/// Shared context of both index handles: routing, the local shard (if this
/// rank hosts one), and the pending table matching remote KV replies back
/// to waiting callers.
pub(crate) struct MetaCtx {
    me: ServerRank,
    router: SliceRouter,
    shard: Option<ShardClient>,
    peers: Option<TransportSender<PeerMsg>>,
    next_seq: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<KvDone>>>,
}

impl MetaCtx {
    pub(crate) fn new(
        me: ServerRank,
        router: SliceRouter,
        shard: Option<ShardClient>,
        peers: Option<TransportSender<PeerMsg>>,
    ) -> Arc<Self> {
        Arc::new(MetaCtx {
            me,
            router,
            shard,
            peers,
            next_seq: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Issues one KV call against its owner rank, local or remote.
    async fn call(
        &self,
        owner: ServerRank,
        call: KvCall,
    ) -> Result<KvDone, StagefsError> {
        if owner == self.me {
            match &self.shard {
                Some(shard) => shard.call(call).await,
                None => {
                    logged_err!(self.me; "rank owns slice but hosts no shard")
                }
            }
        } else {
            let Some(peers) = &self.peers else {
                return logged_err!(self.me;
                                   "no transport to reach owner {}", owner);
            };
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let (tx_done, rx_done) = oneshot::channel();
            self.pending.lock().unwrap().insert(seq, tx_done);
            if let Err(e) = peers.send_msg(PeerMsg::Kv { seq, call }, owner) {
                self.pending.lock().unwrap().remove(&seq);
                return Err(e);
            }
            Ok(rx_done.await?)
        }
    }

    /// Completes a pending remote call; invoked by the delegator event loop
    /// on every inbound `KvReply`.
    pub(crate) fn complete(&self, seq: u64, done: KvDone) {
        match self.pending.lock().unwrap().remove(&seq) {
            Some(tx_done) => {
                if tx_done.send(done).is_err() {
                    pf_warn!(self.me; "kv caller for seq {} gone", seq);
                }
            }
            None => {
                pf_warn!(self.me; "stale kv reply seq {}", seq);
            }
        }
    }
}

/// Typed handle over the distributed extent index.
#[derive(Clone)]
pub struct ExtentIndex {
    ctx: Arc<MetaCtx>,
}

/// Typed handle over the distributed file-attribute index.
#[derive(Clone)]
pub struct AttrIndex {
    ctx: Arc<MetaCtx>,
}

/// Builds the two typed index handles over one shared context.
pub(crate) fn meta_indexes(
    ctx: Arc<MetaCtx>,
) -> (ExtentIndex, AttrIndex) {
    (
        ExtentIndex { ctx: ctx.clone() },
        AttrIndex { ctx },
    )
}

impl ExtentIndex {
    /// Durably inserts all pairs, partitioned by owning rank. Callers are
    /// expected to have pre-coalesced the batch (the client-side segment
    /// tree guarantees no intra-batch overlap). The first error observed
    /// becomes the batch's result, after every owner has been drained.
    pub async fn batch_put(
        &self,
        pairs: Vec<(ExtentKey, ExtentVal)>,
    ) -> Result<(), StagefsError> {
        let mut by_owner: BTreeMap<ServerRank, Vec<(Vec<u8>, Vec<u8>)>> =
            BTreeMap::new();
        for (key, val) in pairs {
            let owner = self.ctx.router.server_of(key.fid, key.offset);
            by_owner
                .entry(owner)
                .or_default()
                .push((key.encode().to_vec(), val.encode().to_vec()));
        }

        let mut first_err: Option<StagefsError> = None;
        for (owner, pairs) in by_owner {
            let outcome = self
                .ctx
                .call(
                    owner,
                    KvCall::BatchPut {
                        index: EXTENT_INDEX_ID,
                        pairs,
                    },
                )
                .await;
            match outcome {
                Ok(KvDone::Ack { errcode: 0 }) => {}
                Ok(KvDone::Ack { errcode }) => {
                    if first_err.is_none() {
                        first_err = Some(StagefsError(format!(
                            "kv batch put errcode {} at rank {}",
                            errcode, owner
                        )));
                    }
                }
                Ok(_) => {
                    if first_err.is_none() {
                        first_err = Some(StagefsError::msg(
                            "unexpected kv result variant",
                        ));
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Looks up every stored pair whose interval intersects one of the
    /// requested closed ranges `(fid, start, end)`. Internally two probe
    /// keys bound each range; scans crossing a slice boundary visit owners
    /// in key order and concatenate. Returns the pairs gathered (ascending
    /// key, deduplicated) plus the first error code observed, preserving
    /// partial results so the caller can still make progress.
    pub async fn range_get(
        &self,
        ranges: &[(Fid, u64, u64)],
    ) -> (Vec<(ExtentKey, ExtentVal)>, i32) {
        let mut found: BTreeMap<ExtentKey, ExtentVal> = BTreeMap::new();
        let mut first_err = errcode::OK;
        let record_err = |e: i32, first_err: &mut i32| {
            if *first_err == errcode::OK {
                *first_err = e;
            }
        };

        for &(fid, start, end) in ranges {
            let parts = self.ctx.router.split_range(fid, start, end);
            for (i, &(owner, lo, hi)) in parts.iter().enumerate() {
                let lo_key = ExtentKey { fid, offset: lo }.encode().to_vec();
                let hi_key = ExtentKey { fid, offset: hi }.encode().to_vec();
                let outcome = self
                    .ctx
                    .call(
                        owner,
                        KvCall::Scan {
                            index: EXTENT_INDEX_ID,
                            lo: lo_key,
                            hi: hi_key,
                            // only the first sub-range may be covered by an
                            // extent starting below it
                            with_pred: i == 0,
                        },
                    )
                    .await;
                let pairs = match outcome {
                    Ok(KvDone::Pairs { errcode: e, pairs }) => {
                        if e != errcode::OK {
                            record_err(e, &mut first_err);
                        }
                        pairs
                    }
                    Ok(_) => {
                        record_err(errcode::KV, &mut first_err);
                        continue;
                    }
                    Err(_) => {
                        record_err(errcode::TRANSPORT, &mut first_err);
                        continue;
                    }
                };
                for (kbytes, vbytes) in pairs {
                    let (key, val) = match (
                        ExtentKey::decode(&kbytes),
                        ExtentVal::decode(&vbytes),
                    ) {
                        (Ok(k), Ok(v)) => (k, v),
                        _ => {
                            record_err(errcode::KV, &mut first_err);
                            continue;
                        }
                    };
                    // drop predecessor hits of other files or ones ending
                    // before the requested range
                    if key.fid != fid
                        || val.len == 0
                        || key.offset > end
                        || key.offset + val.len - 1 < start
                    {
                        continue;
                    }
                    found.insert(key, val);
                }
            }
        }

        (found.into_iter().collect(), first_err)
    }
}

impl AttrIndex {
    /// Inserts or overwrites the attribute record of one gfid.
    pub async fn put(&self, attr: FileAttr) -> Result<(), StagefsError> {
        self.batch_put(vec![attr]).await
    }

    /// Inserts a batch of attribute records, partitioned by owning rank;
    /// observationally equivalent to sequential puts with last writer
    /// winning per gfid.
    pub async fn batch_put(
        &self,
        attrs: Vec<FileAttr>,
    ) -> Result<(), StagefsError> {
        let mut by_owner: BTreeMap<ServerRank, Vec<(Vec<u8>, Vec<u8>)>> =
            BTreeMap::new();
        for attr in attrs {
            let owner = self.ctx.router.server_of_attr(attr.gfid);
            let mut val = vec![0u8; crate::common::layout::ATTR_REC_LEN];
            attr.encode(&mut val);
            by_owner
                .entry(owner)
                .or_default()
                .push((attr_key(attr.gfid), val));
        }

        let mut first_err: Option<StagefsError> = None;
        for (owner, pairs) in by_owner {
            let outcome = self
                .ctx
                .call(
                    owner,
                    KvCall::BatchPut {
                        index: ATTR_INDEX_ID,
                        pairs,
                    },
                )
                .await;
            match outcome {
                Ok(KvDone::Ack { errcode: 0 }) => {}
                Ok(_) => {
                    if first_err.is_none() {
                        first_err =
                            Some(StagefsError::msg("attr batch put failed"));
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fetches the attribute record of one gfid, `None` if absent.
    pub async fn get(
        &self,
        gfid: Gfid,
    ) -> Result<Option<FileAttr>, StagefsError> {
        let owner = self.ctx.router.server_of_attr(gfid);
        let outcome = self
            .ctx
            .call(
                owner,
                KvCall::Get {
                    index: ATTR_INDEX_ID,
                    key: attr_key(gfid),
                },
            )
            .await?;
        match outcome {
            KvDone::Val { errcode: 0, val } => match val {
                Some(bytes) => Ok(Some(FileAttr::decode(&bytes)?)),
                None => Ok(None),
            },
            KvDone::Val { errcode: e, .. } => {
                Err(StagefsError(format!("attr get errcode {}", e)))
            }
            _ => Err(StagefsError::msg("unexpected kv result variant")),
        }
    }
}

#[cfg(test)]
mod index_tests {
    use super::*;
    use crate::server::store::ShardHub;

    async fn local_indexes(
        tag: &str,
        slice_width: u64,
    ) -> Result<(ShardHub, ExtentIndex, AttrIndex), StagefsError> {
        let dir = std::env::temp_dir()
            .join(format!("stagefs-index-test-{}-{}", tag, std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let hub = ShardHub::new_and_setup(0, &dir, "metakv").await?;
        let ctx = MetaCtx::new(
            0,
            SliceRouter::new(slice_width, 1),
            Some(hub.client()),
            None,
        );
        let (extents, attrs) = meta_indexes(ctx);
        Ok((hub, extents, attrs))
    }

    fn ext(
        fid: Fid,
        offset: u64,
        addr: u64,
        len: u64,
    ) -> (ExtentKey, ExtentVal) {
        (
            ExtentKey { fid, offset },
            ExtentVal {
                addr,
                len,
                delegator: 0,
                app_id: 1,
                client_rank: 0,
            },
        )
    }

    #[test]
    fn extent_key_byte_order_matches_key_order() {
        let keys = [
            ExtentKey { fid: 1, offset: 500 },
            ExtentKey { fid: 2, offset: 0 },
            ExtentKey { fid: 2, offset: 64 },
            ExtentKey {
                fid: 2,
                offset: 1 << 40,
            },
            ExtentKey { fid: 3, offset: 1 },
        ];
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].encode() < pair[1].encode());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_index_returns_zero_pairs() -> Result<(), StagefsError> {
        let (mut hub, extents, _) = local_indexes("empty", 1024).await?;
        let (pairs, err) = extents.range_get(&[(7, 0, 4095)]).await;
        assert_eq!(err, 0);
        assert!(pairs.is_empty());
        hub.close(true).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn covering_extent_found_by_probe() -> Result<(), StagefsError> {
        let (mut hub, extents, _) = local_indexes("cover", 1 << 20).await?;
        extents
            .batch_put(vec![ext(7, 0, 0, 64), ext(7, 64, 64, 64)])
            .await?;

        // probe starting inside the first extent must still find it
        let (pairs, err) = extents.range_get(&[(7, 32, 100)]).await;
        assert_eq!(err, 0);
        assert_eq!(
            pairs.iter().map(|(k, _)| k.offset).collect::<Vec<_>>(),
            vec![0, 64]
        );

        // unrelated fid sees nothing
        let (pairs, err) = extents.range_get(&[(8, 0, 1000)]).await;
        assert_eq!(err, 0);
        assert!(pairs.is_empty());
        hub.close(true).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scan_across_slice_boundary() -> Result<(), StagefsError> {
        // slice width 128 so the range [0, 300] spans three slices
        let (mut hub, extents, _) = local_indexes("slices", 128).await?;
        extents
            .batch_put(vec![
                ext(3, 0, 0, 100),
                ext(3, 150, 100, 50),
                ext(3, 290, 150, 20),
            ])
            .await?;

        let (pairs, err) = extents.range_get(&[(3, 0, 300)]).await;
        assert_eq!(err, 0);
        assert_eq!(
            pairs.iter().map(|(k, _)| k.offset).collect::<Vec<_>>(),
            vec![0, 150, 290]
        );
        hub.close(true).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn attr_put_get_round_trip() -> Result<(), StagefsError> {
        let (mut hub, _, attrs) = local_indexes("attr", 1024).await?;
        assert_eq!(attrs.get(42).await?, None);

        let attr = FileAttr {
            gfid: 42,
            fid: 9,
            filename: "/checkpoint/rank0.ckpt".into(),
            size: 1 << 20,
            mode: 0o600,
            ..Default::default()
        };
        attrs.put(attr.clone()).await?;
        assert_eq!(attrs.get(42).await?, Some(attr));

        // batch put behaves like sequential puts, last writer wins
        let mut newer = FileAttr {
            gfid: 42,
            size: 2 << 20,
            ..Default::default()
        };
        newer.filename = "/checkpoint/rank0.ckpt".into();
        attrs
            .batch_put(vec![
                FileAttr {
                    gfid: 43,
                    ..Default::default()
                },
                newer.clone(),
            ])
            .await?;
        assert_eq!(attrs.get(42).await?.unwrap().size, 2 << 20);
        assert!(attrs.get(43).await?.is_some());
        hub.close(true).await
    }
}
