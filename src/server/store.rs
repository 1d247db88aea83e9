//! Per-server ordered key-value shard backing the distributed metadata
//! index.
//!
//! Each metadata server rank hosts one `ShardHub`: a spawned task that owns
//! two ordered byte-string maps (extent index and file-attribute index) and
//! their append-only backing files. Callers submit actions over a channel
//! and get results on oneshot acks; a batch put is applied and fsynced to
//! the backing file before its ack, so an acknowledged batch is durable and
//! never observable partially.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::common::{errcode, ServerRank};
use crate::utils::StagefsError;

/// Logical index id within a shard.
pub type IndexId = u8;

/// Index of extent keys `(fid, offset)`.
pub const EXTENT_INDEX_ID: IndexId = 0;
/// Index of file-attribute keys (gfid).
pub const ATTR_INDEX_ID: IndexId = 1;

/// Action submitted to a shard, locally or from a remote rank.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum KvCall {
    /// Insert all pairs; last writer wins per key. Durable once acked.
    BatchPut {
        index: IndexId,
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
    },

    /// Point lookup.
    Get { index: IndexId, key: Vec<u8> },

    /// Ordered scan of `[lo, hi]`; with `with_pred` the greatest key
    /// strictly below `lo` is included too, so callers can catch an extent
    /// covering `lo` that starts before it.
    Scan {
        index: IndexId,
        lo: Vec<u8>,
        hi: Vec<u8>,
        with_pred: bool,
    },
}

impl KvCall {
    /// Builds the error result matching this call's shape.
    pub fn error_done(&self, errcode: i32) -> KvDone {
        match self {
            KvCall::BatchPut { .. } => KvDone::Ack { errcode },
            KvCall::Get { .. } => KvDone::Val { errcode, val: None },
            KvCall::Scan { .. } => KvDone::Pairs {
                errcode,
                pairs: vec![],
            },
        }
    }
}

/// Result of a shard action.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum KvDone {
    /// Outcome of a `BatchPut`.
    Ack { errcode: i32 },

    /// Outcome of a `Get`; `None` when the key is absent.
    Val {
        errcode: i32,
        val: Option<Vec<u8>>,
    },

    /// Outcome of a `Scan`, pairs in ascending key order.
    Pairs {
        errcode: i32,
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
    },
}

enum ShardReq {
    Call(KvCall, oneshot::Sender<KvDone>),
    Close {
        sanitize: bool,
        done: oneshot::Sender<()>,
    },
}

/// Handle for submitting actions to a shard task; cloned into every
/// component that talks to the local shard.
#[derive(Clone)]
pub struct ShardClient {
    tx_req: mpsc::UnboundedSender<ShardReq>,
}

impl ShardClient {
    /// Submits one action and waits for its result.
    pub async fn call(&self, call: KvCall) -> Result<KvDone, StagefsError> {
        let (tx_done, rx_done) = oneshot::channel();
        self.tx_req
            .send(ShardReq::Call(call, tx_done))
            .map_err(|_| StagefsError::msg("shard task has exited"))?;
        Ok(rx_done.await?)
    }
}

/// Ordered KV shard module; owns the shard task for this server rank.
pub struct ShardHub {
    me: ServerRank,
    tx_req: mpsc::UnboundedSender<ShardReq>,
    shard_handle: Option<JoinHandle<()>>,
}

impl ShardHub {
    /// Creates the backing files (replaying any existing content) and
    /// spawns the shard task.
    pub async fn new_and_setup(
        me: ServerRank,
        db_path: &Path,
        db_name: &str,
    ) -> Result<Self, StagefsError> {
        fs::create_dir_all(db_path).await?;

        let mut indexes = vec![];
        for index_id in [EXTENT_INDEX_ID, ATTR_INDEX_ID] {
            let file_path =
                db_path.join(format!("{}-{}-{}", db_name, index_id, me));
            let index = ShardIndex::open(me, index_id, file_path).await?;

            // manifest records what this backing file holds
            let manifest_path = db_path
                .join(format!("{}.manifest{}_{}_{}", db_name, 0, index_id, me));
            fs::write(
                &manifest_path,
                format!("stagefs-index type=0 id={} rank={}\n", index_id, me),
            )
            .await?;
            indexes.push((index, manifest_path));
        }

        let (tx_req, rx_req) = mpsc::unbounded_channel();
        let shard_handle =
            tokio::spawn(Self::shard_task(me, indexes, rx_req));

        Ok(ShardHub {
            me,
            tx_req,
            shard_handle: Some(shard_handle),
        })
    }

    /// Returns a cloneable client handle for this shard.
    pub fn client(&self) -> ShardClient {
        ShardClient {
            tx_req: self.tx_req.clone(),
        }
    }

    /// Flushes and closes the shard, optionally removing its on-disk files.
    pub async fn close(&mut self, sanitize: bool) -> Result<(), StagefsError> {
        let (tx_done, rx_done) = oneshot::channel();
        self.tx_req
            .send(ShardReq::Close {
                sanitize,
                done: tx_done,
            })
            .map_err(|_| StagefsError::msg("shard task already exited"))?;
        rx_done.await?;
        if let Some(handle) = self.shard_handle.take() {
            handle.await?;
        }
        pf_debug!(self.me; "shard closed (sanitize={})", sanitize);
        Ok(())
    }

    /// Shard task function: applies actions serially, so a batch is never
    /// observable half-applied.
    async fn shard_task(
        me: ServerRank,
        mut indexes: Vec<(ShardIndex, PathBuf)>,
        mut rx_req: mpsc::UnboundedReceiver<ShardReq>,
    ) {
        pf_debug!(me; "shard task spawned");

        while let Some(req) = rx_req.recv().await {
            match req {
                ShardReq::Call(call, tx_done) => {
                    let done = Self::do_call(me, &mut indexes, call).await;
                    if tx_done.send(done).is_err() {
                        pf_warn!(me; "shard result receiver dropped");
                    }
                }
                ShardReq::Close { sanitize, done } => {
                    for (index, manifest_path) in indexes.iter_mut() {
                        if let Err(e) = index.close(sanitize).await {
                            pf_error!(me; "error closing index {}: {}",
                                      index.index_id, e);
                        }
                        if sanitize {
                            let _ = fs::remove_file(&manifest_path).await;
                        }
                    }
                    let _ = done.send(());
                    break;
                }
            }
        }

        pf_debug!(me; "shard task exited");
    }

    async fn do_call(
        me: ServerRank,
        indexes: &mut [(ShardIndex, PathBuf)],
        call: KvCall,
    ) -> KvDone {
        let index_id = match call {
            KvCall::BatchPut { index, .. }
            | KvCall::Get { index, .. }
            | KvCall::Scan { index, .. } => index,
        };
        let Some((index, _)) = indexes.get_mut(index_id as usize) else {
            pf_error!(me; "unknown index id {}", index_id);
            return match call {
                KvCall::BatchPut { .. } => KvDone::Ack {
                    errcode: errcode::BAD_REQUEST,
                },
                KvCall::Get { .. } => KvDone::Val {
                    errcode: errcode::BAD_REQUEST,
                    val: None,
                },
                KvCall::Scan { .. } => KvDone::Pairs {
                    errcode: errcode::BAD_REQUEST,
                    pairs: vec![],
                },
            };
        };

        match call {
            KvCall::BatchPut { pairs, .. } => {
                match index.batch_put(pairs).await {
                    Ok(()) => KvDone::Ack {
                        errcode: errcode::OK,
                    },
                    Err(e) => {
                        pf_error!(me; "batch put failed: {}", e);
                        KvDone::Ack {
                            errcode: errcode::KV,
                        }
                    }
                }
            }
            KvCall::Get { key, .. } => KvDone::Val {
                errcode: errcode::OK,
                val: index.map.get(&key).cloned(),
            },
            KvCall::Scan {
                lo, hi, with_pred, ..
            } => KvDone::Pairs {
                errcode: errcode::OK,
                pairs: index.scan(&lo, &hi, with_pred),
            },
        }
    }
}

/// One ordered map plus its append-only backing file.
struct ShardIndex {
    me: ServerRank,
    index_id: IndexId,
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    backer: File,
    file_path: PathBuf,
}

impl ShardIndex {
    /// Opens (or creates) the backing file and replays it into the map.
    async fn open(
        me: ServerRank,
        index_id: IndexId,
        file_path: PathBuf,
    ) -> Result<Self, StagefsError> {
        if !fs::try_exists(&file_path).await? {
            File::create(&file_path).await?;
            pf_info!(me; "created index file '{}'", file_path.display());
        }
        let mut backer = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&file_path)
            .await?;

        let mut map = BTreeMap::new();
        let file_size = backer.metadata().await?.len();
        let mut offset = 0u64;
        while offset + 8 <= file_size {
            backer.seek(SeekFrom::Start(offset)).await?;
            let key_len = backer.read_u32().await? as u64;
            let val_len = backer.read_u32().await? as u64;
            if offset + 8 + key_len + val_len > file_size {
                pf_warn!(me; "truncated record at offset {}, discarding tail",
                         offset);
                break;
            }
            let mut key = vec![0u8; key_len as usize];
            backer.read_exact(&mut key).await?;
            let mut val = vec![0u8; val_len as usize];
            backer.read_exact(&mut val).await?;
            map.insert(key, val);
            offset += 8 + key_len + val_len;
        }
        backer.set_len(offset).await?;
        backer.seek(SeekFrom::End(0)).await?;
        if !map.is_empty() {
            pf_info!(me; "replayed {} records for index {}", map.len(),
                     index_id);
        }

        Ok(ShardIndex {
            me,
            index_id,
            map,
            backer,
            file_path,
        })
    }

    /// Applies and persists one batch; the fsync happens before returning.
    async fn batch_put(
        &mut self,
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<(), StagefsError> {
        for (key, val) in &pairs {
            self.backer.write_u32(key.len() as u32).await?;
            self.backer.write_u32(val.len() as u32).await?;
            self.backer.write_all(key).await?;
            self.backer.write_all(val).await?;
        }
        self.backer.sync_data().await?;
        for (key, val) in pairs {
            self.map.insert(key, val);
        }
        Ok(())
    }

    /// Ordered scan of `[lo, hi]`, optionally preceded by the greatest key
    /// strictly below `lo`.
    fn scan(
        &self,
        lo: &[u8],
        hi: &[u8],
        with_pred: bool,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = vec![];
        if with_pred {
            if let Some((k, v)) = self
                .map
                .range::<[u8], _>((
                    Bound::Unbounded,
                    Bound::Excluded(lo),
                ))
                .next_back()
            {
                pairs.push((k.clone(), v.clone()));
            }
        }
        for (k, v) in self.map.range::<[u8], _>((
            Bound::Included(lo),
            Bound::Included(hi),
        )) {
            pairs.push((k.clone(), v.clone()));
        }
        pairs
    }

    /// Writes the stats sidecar and closes; sanitizing removes both files.
    async fn close(&mut self, sanitize: bool) -> Result<(), StagefsError> {
        self.backer.sync_all().await?;
        let stats_path = PathBuf::from(format!(
            "{}_stats",
            self.file_path.display()
        ));
        if sanitize {
            let _ = fs::remove_file(&stats_path).await;
            fs::remove_file(&self.file_path).await?;
        } else {
            fs::write(
                &stats_path,
                format!("records={}\n", self.map.len()),
            )
            .await?;
        }
        pf_debug!(self.me; "index {} closed", self.index_id);
        Ok(())
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;

    fn pair(k: &str, v: &str) -> (Vec<u8>, Vec<u8>) {
        (k.as_bytes().to_vec(), v.as_bytes().to_vec())
    }

    async fn fresh_hub(tag: &str) -> Result<ShardHub, StagefsError> {
        let dir = std::env::temp_dir()
            .join(format!("stagefs-store-test-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir).await;
        ShardHub::new_and_setup(0, &dir, "metakv").await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn put_then_get() -> Result<(), StagefsError> {
        let mut hub = fresh_hub("putget").await?;
        let client = hub.client();
        let done = client
            .call(KvCall::BatchPut {
                index: ATTR_INDEX_ID,
                pairs: vec![pair("k1", "v1"), pair("k2", "v2")],
            })
            .await?;
        assert_eq!(done, KvDone::Ack { errcode: 0 });

        let done = client
            .call(KvCall::Get {
                index: ATTR_INDEX_ID,
                key: b"k2".to_vec(),
            })
            .await?;
        assert_eq!(
            done,
            KvDone::Val {
                errcode: 0,
                val: Some(b"v2".to_vec())
            }
        );

        // unknown key
        let done = client
            .call(KvCall::Get {
                index: ATTR_INDEX_ID,
                key: b"nope".to_vec(),
            })
            .await?;
        assert_eq!(done, KvDone::Val { errcode: 0, val: None });

        hub.close(true).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scan_empty_index() -> Result<(), StagefsError> {
        let mut hub = fresh_hub("scanempty").await?;
        let client = hub.client();
        let done = client
            .call(KvCall::Scan {
                index: EXTENT_INDEX_ID,
                lo: vec![0],
                hi: vec![255],
                with_pred: true,
            })
            .await?;
        assert_eq!(done, KvDone::Pairs { errcode: 0, pairs: vec![] });
        hub.close(true).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scan_with_predecessor() -> Result<(), StagefsError> {
        let mut hub = fresh_hub("scanpred").await?;
        let client = hub.client();
        client
            .call(KvCall::BatchPut {
                index: EXTENT_INDEX_ID,
                pairs: vec![pair("a", "1"), pair("c", "2"), pair("e", "3")],
            })
            .await?;

        let done = client
            .call(KvCall::Scan {
                index: EXTENT_INDEX_ID,
                lo: b"d".to_vec(),
                hi: b"z".to_vec(),
                with_pred: true,
            })
            .await?;
        assert_eq!(
            done,
            KvDone::Pairs {
                errcode: 0,
                pairs: vec![pair("c", "2"), pair("e", "3")]
            }
        );

        let done = client
            .call(KvCall::Scan {
                index: EXTENT_INDEX_ID,
                lo: b"d".to_vec(),
                hi: b"z".to_vec(),
                with_pred: false,
            })
            .await?;
        assert_eq!(
            done,
            KvDone::Pairs {
                errcode: 0,
                pairs: vec![pair("e", "3")]
            }
        );
        hub.close(true).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn last_writer_wins_and_replay() -> Result<(), StagefsError> {
        let dir = std::env::temp_dir().join(format!(
            "stagefs-store-test-replay-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir).await;

        let mut hub = ShardHub::new_and_setup(0, &dir, "metakv").await?;
        let client = hub.client();
        client
            .call(KvCall::BatchPut {
                index: ATTR_INDEX_ID,
                pairs: vec![pair("g7", "old")],
            })
            .await?;
        client
            .call(KvCall::BatchPut {
                index: ATTR_INDEX_ID,
                pairs: vec![pair("g7", "new")],
            })
            .await?;
        hub.close(false).await?;

        // restart on the same files: latest value must survive
        let mut hub = ShardHub::new_and_setup(0, &dir, "metakv").await?;
        let done = hub
            .client()
            .call(KvCall::Get {
                index: ATTR_INDEX_ID,
                key: b"g7".to_vec(),
            })
            .await?;
        assert_eq!(
            done,
            KvDone::Val {
                errcode: 0,
                val: Some(b"new".to_vec())
            }
        );
        hub.close(true).await
    }
}
