//! Client-side library: mount, log-structured writes, fsync, and reads
//! against the node-local delegator.

mod apistub;
mod superblock;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::common::{
    errcode, layout::READ_REQ_LEN, layout::REPLY_HDR_LEN, AppId, ClientId,
    FileAttr, Fid, Gfid, IndexRecord, ReadRequest, ReplyHeader, SegTree,
    ServerRank, SuperblockLayout,
};
use crate::server::{conn_id, ApiReply, ApiRequest, MountInfo};
use crate::utils::{page_size, ShmRegion, StagefsError};

pub use apistub::ClientApiStub;
pub use superblock::SuperblockWriter;

/// Configuration parameters struct.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ClientConfig {
    /// In-memory data log size in bytes.
    pub data_size: usize,

    /// Index record region size in bytes.
    pub meta_size: usize,

    /// Attribute record region size in bytes.
    pub fmeta_size: usize,

    /// Read-request region size in bytes.
    pub req_buf_sz: usize,

    /// Read-reply region size in bytes.
    pub recv_buf_sz: usize,

    /// Spill file capacity in bytes.
    pub spill_sz: usize,

    /// Directory for spill files.
    pub external_spill_dir: String,
}

#[allow(clippy::derivable_impls)]
impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            data_size: 4 << 20,
            meta_size: 1 << 20,
            fmeta_size: 1 << 20,
            req_buf_sz: 1 << 20,
            recv_buf_sz: 8 << 20,
            spill_sz: 64 << 20,
            external_spill_dir: "/tmp/stagefs-spill".into(),
        }
    }
}

/// One reply record parsed out of the reply region after a read.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ReadReply {
    pub fid: Fid,
    pub offset: u64,
    pub data: Vec<u8>,
    pub errcode: i32,
}

/// Outcome of one read call.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ReadResult {
    /// Overall error code of the read RPC (OK for short reads).
    pub errcode: i32,
    /// Total bytes fetched successfully.
    pub bytes_ok: u64,
    /// Per-range replies, in reply-region order.
    pub replies: Vec<ReadReply>,
}

/// StageFS client endpoint: one per application process.
pub struct StagefsClient {
    app_id: AppId,
    client_id: ClientId,
    dbg_rank: i32,

    config: ClientConfig,
    page: usize,
    layout: SuperblockLayout,

    /// Established connection to the node-local delegator.
    stub: Option<ClientApiStub>,

    /// My superblock and spill files, created at mount.
    writer: Option<SuperblockWriter>,
    req_buf: Option<ShmRegion>,
    reply_buf: Option<ShmRegion>,

    /// One coalescing segment tree per written file.
    trees: BTreeMap<Fid, SegTree>,

    /// Attribute records dirtied since the last fsync.
    dirty_attrs: BTreeMap<Gfid, FileAttr>,

    /// Learned at mount.
    server_rank: ServerRank,
    num_delegators: u32,
}

impl StagefsClient {
    /// Creates a new client endpoint (not yet mounted).
    pub fn new(
        app_id: AppId,
        client_id: ClientId,
        dbg_rank: i32,
        config_str: Option<&str>,
    ) -> Result<Self, StagefsError> {
        let config = parsed_config!(config_str => ClientConfig;
                                    data_size, meta_size, fmeta_size,
                                    req_buf_sz, recv_buf_sz, spill_sz,
                                    external_spill_dir)?;
        let page = page_size();
        let layout = SuperblockLayout::compute(
            config.data_size,
            config.meta_size,
            config.fmeta_size,
            page,
        );

        Ok(StagefsClient {
            app_id,
            client_id,
            dbg_rank,
            config,
            page,
            layout,
            stub: None,
            writer: None,
            req_buf: None,
            reply_buf: None,
            trees: BTreeMap::new(),
            dirty_attrs: BTreeMap::new(),
            server_rank: 0,
            num_delegators: 0,
        })
    }

    fn tag(&self) -> String {
        format!("{}/{}", self.app_id, self.client_id)
    }

    /// Delegator rank this client mounted on.
    pub fn server_rank(&self) -> ServerRank {
        self.server_rank
    }

    /// Number of delegators in the job, learned at mount.
    pub fn num_delegators(&self) -> u32 {
        self.num_delegators
    }

    /// Creates the shared regions and spill files, then mounts on the
    /// node-local delegator.
    pub async fn mount(
        &mut self,
        server_addr: SocketAddr,
    ) -> Result<(), StagefsError> {
        if self.stub.is_some() {
            return logged_err!(self.tag(); "mounting while mounted");
        }

        let super_name =
            format!("stagefs-super-{}-{}", self.app_id, self.client_id);
        let req_name =
            format!("stagefs-req-{}-{}", self.app_id, self.client_id);
        let reply_name =
            format!("stagefs-reply-{}-{}", self.app_id, self.client_id);

        let spill_dir = PathBuf::from(&self.config.external_spill_dir);
        std::fs::create_dir_all(&spill_dir)?;
        let spill_data_path = spill_dir.join(format!(
            "spill-data-{}-{}.log",
            self.app_id, self.client_id
        ));
        let spill_index_path = spill_dir.join(format!(
            "spill-index-{}-{}.log",
            self.app_id, self.client_id
        ));

        let writer = SuperblockWriter::create(
            &super_name,
            self.layout,
            self.page,
            &spill_data_path,
            &spill_index_path,
            self.config.spill_sz,
        )?;
        let req_buf = ShmRegion::create(&req_name, self.config.req_buf_sz)?;
        let reply_buf =
            ShmRegion::create(&reply_name, self.config.recv_buf_sz)?;

        let conn = conn_id(self.app_id, self.client_id);
        let mut stub = ClientApiStub::connect(conn, server_addr).await?;
        let reply = stub
            .call(&ApiRequest::Mount {
                info: MountInfo {
                    app_id: self.app_id,
                    client_id: self.client_id,
                    dbg_rank: self.dbg_rank,
                    layout: self.layout,
                    super_name,
                    req_name,
                    req_buf_sz: self.config.req_buf_sz,
                    reply_name,
                    recv_buf_sz: self.config.recv_buf_sz,
                    spill_data_path: spill_data_path
                        .to_string_lossy()
                        .into_owned(),
                    spill_index_path: spill_index_path
                        .to_string_lossy()
                        .into_owned(),
                },
            })
            .await?;

        match reply {
            ApiReply::MountAck {
                errcode: 0,
                rank,
                num_delegators,
            } => {
                self.server_rank = rank;
                self.num_delegators = num_delegators;
                self.stub = Some(stub);
                self.writer = Some(writer);
                self.req_buf = Some(req_buf);
                self.reply_buf = Some(reply_buf);
                pf_info!(self.tag(); "mounted on delegator {} of {}", rank,
                         num_delegators);
                Ok(())
            }
            ApiReply::MountAck { errcode: code, .. } => {
                logged_err!(self.tag(); "mount rejected, errcode {}", code)
            }
            _ => logged_err!(self.tag(); "unexpected reply to mount"),
        }
    }

    /// Appends one write to the data log and coalesces it into the file's
    /// segment tree. Zero-length writes are no-ops.
    pub fn pwrite(
        &mut self,
        fid: Fid,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StagefsError> {
        if data.is_empty() {
            return Ok(());
        }
        let Some(writer) = self.writer.as_mut() else {
            return logged_err!(self.tag(); "pwrite before mount");
        };

        let mem_pos = writer.append_data(data)?;
        self.trees
            .entry(fid)
            .or_default()
            .add(offset, offset + data.len() as u64 - 1, mem_pos)
    }

    /// Records a dirty attribute record, promoted at the next fsync.
    pub fn set_attr(&mut self, attr: FileAttr) {
        self.dirty_attrs.insert(attr.gfid, attr);
    }

    /// Promotes every coalesced extent and dirty attribute into the
    /// distributed indexes. Large batches take multiple rounds capped by
    /// the index region capacity; already-committed rounds stay committed
    /// on error.
    ///
    /// The segment trees are kept, not cleared: each fsync re-puts the
    /// full coalesced view, so an extent key shortened by a later
    /// overlapping write overwrites its stale index entry and readers
    /// always observe the latest bytes.
    pub async fn fsync(&mut self) -> Result<(), StagefsError> {
        if self.stub.is_none() || self.writer.is_none() {
            return logged_err!(self.tag(); "fsync before mount");
        }

        // walk every tree under one read guard each, in fid order
        let mut records = vec![];
        for (&fid, tree) in &self.trees {
            let guard = tree.read();
            for seg in guard.iter() {
                records.push(IndexRecord {
                    fid,
                    file_pos: seg.start,
                    mem_pos: seg.ptr,
                    length: seg.end - seg.start + 1,
                });
            }
        }
        let attrs: Vec<FileAttr> =
            self.dirty_attrs.values().cloned().collect();

        {
            let writer = self.writer.as_mut().unwrap();
            writer.flush_spill()?;
            writer.persist_index_records(&records)?;
        }

        // a batch larger than a region goes up in multiple rounds
        let index_cap = self.layout.index_capacity(self.page).max(1);
        let attr_cap = self.layout.attr_capacity(self.page).max(1);
        let num_rounds = records
            .len()
            .div_ceil(index_cap)
            .max(attrs.len().div_ceil(attr_cap))
            .max(1);

        for round in 0..num_rounds {
            let lo = round * index_cap;
            let round_records =
                &records[lo.min(records.len())
                    ..(lo + index_cap).min(records.len())];
            let lo = round * attr_cap;
            let round_attrs = &attrs
                [lo.min(attrs.len())..(lo + attr_cap).min(attrs.len())];

            {
                let writer = self.writer.as_ref().unwrap();
                writer.stage_index_records(round_records)?;
                writer.stage_attr_records(round_attrs)?;
            }

            let reply = self
                .stub
                .as_mut()
                .unwrap()
                .call(&ApiRequest::Fsync {
                    app_id: self.app_id,
                    client_id: self.client_id,
                })
                .await?;
            match reply {
                ApiReply::Fsync { errcode: 0 } => {}
                ApiReply::Fsync { errcode: code } => {
                    return logged_err!(self.tag();
                                       "fsync failed, errcode {}", code);
                }
                _ => {
                    return logged_err!(self.tag();
                                       "unexpected reply to fsync");
                }
            }
        }

        self.dirty_attrs.clear();
        Ok(())
    }

    /// Reads a batch of `(fid, offset, length)` ranges; data comes back
    /// through the reply region. Short reads surface as fewer reply bytes
    /// with errcode OK.
    pub async fn read(
        &mut self,
        reqs: &[(Fid, u64, u64)],
    ) -> Result<ReadResult, StagefsError> {
        if self.stub.is_none() {
            return logged_err!(self.tag(); "read before mount");
        }
        let req_buf = self.req_buf.as_ref().unwrap();
        let reply_buf = self.reply_buf.as_ref().unwrap();
        if 8 + reqs.len() * READ_REQ_LEN > self.config.req_buf_sz {
            return logged_err!(self.tag(); "too many read requests: {}",
                               reqs.len());
        }

        // stage request records and reset the reply count word
        let mut rec = [0u8; READ_REQ_LEN];
        for (i, &(fid, offset, length)) in reqs.iter().enumerate() {
            ReadRequest {
                fid,
                offset,
                length,
            }
            .encode(&mut rec);
            req_buf.write_at(8 + i * READ_REQ_LEN, &rec)?;
        }
        req_buf.write_u64(0, reqs.len() as u64)?;
        reply_buf.write_u64(0, 0)?;

        let reply = self
            .stub
            .as_mut()
            .unwrap()
            .call(&ApiRequest::Read {
                app_id: self.app_id,
                client_id: self.client_id,
                req_cnt: reqs.len() as u32,
            })
            .await?;
        let (code, bytes_ok) = match reply {
            ApiReply::ReadDone { errcode, bytes_ok } => (errcode, bytes_ok),
            _ => {
                return logged_err!(self.tag(); "unexpected reply to read");
            }
        };

        // parse the deposited reply records
        let count = reply_buf.read_u64(0)? as usize;
        let mut replies = Vec::with_capacity(count);
        let mut cursor = 8usize;
        let mut hdr_bytes = [0u8; REPLY_HDR_LEN];
        for _ in 0..count {
            reply_buf.read_at(cursor, &mut hdr_bytes)?;
            let hdr = ReplyHeader::decode(&hdr_bytes)?;
            let mut data = vec![];
            if hdr.errcode == errcode::OK {
                data = vec![0u8; hdr.length as usize];
                reply_buf.read_at(cursor + REPLY_HDR_LEN, &mut data)?;
            }
            replies.push(ReadReply {
                fid: hdr.fid,
                offset: hdr.offset,
                data,
                errcode: hdr.errcode,
            });
            cursor += REPLY_HDR_LEN + hdr.length as usize;
        }

        Ok(ReadResult {
            errcode: code,
            bytes_ok,
            replies,
        })
    }

    /// Fetches the attribute record of one gfid.
    pub async fn get_attr(
        &mut self,
        gfid: Gfid,
    ) -> Result<Option<FileAttr>, StagefsError> {
        let Some(stub) = self.stub.as_mut() else {
            return logged_err!(self.tag(); "get_attr before mount");
        };
        match stub.call(&ApiRequest::GetAttr { gfid }).await? {
            ApiReply::Attr { errcode: 0, attr } => Ok(attr),
            ApiReply::Attr {
                errcode: errcode::NOT_FOUND,
                ..
            } => Ok(None),
            ApiReply::Attr { errcode: code, .. } => {
                logged_err!(self.tag(); "get_attr failed, errcode {}", code)
            }
            _ => logged_err!(self.tag(); "unexpected reply to get_attr"),
        }
    }

    /// Detaches from the delegator and releases the shared regions.
    pub async fn unmount(&mut self) -> Result<(), StagefsError> {
        let Some(stub) = self.stub.as_mut() else {
            return logged_err!(self.tag(); "unmount before mount");
        };
        let reply = stub
            .call(&ApiRequest::Unmount {
                app_id: self.app_id,
                client_id: self.client_id,
            })
            .await?;
        match reply {
            ApiReply::UnmountAck { errcode: 0 } => {}
            ApiReply::UnmountAck { errcode: code } => {
                pf_warn!(self.tag(); "unmount errcode {}", code);
            }
            _ => {
                return logged_err!(self.tag();
                                   "unexpected reply to unmount");
            }
        }

        // dropping the regions unlinks them (we are the creator)
        self.stub = None;
        self.writer = None;
        self.req_buf = None;
        self.reply_buf = None;
        self.trees.clear();
        self.dirty_attrs.clear();
        pf_info!(self.tag(); "unmounted");
        Ok(())
    }
}
