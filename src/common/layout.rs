//! Shared-memory superblock layout and the fixed-width record formats that
//! cross it.
//!
//! The superblock is one contiguous named region per client: a data log, an
//! index-record region, and a file-attribute region, each prefixed by a
//! `u64` count word with the record array starting one page after the count
//! (alignment convention shared by client and server). Separate named
//! regions hold the read-request and read-reply buffers. All records are
//! fixed-width little-endian so both sides agree on layout without any
//! serializer in the hot path.

use serde::{Deserialize, Serialize};

use crate::utils::StagefsError;

/// Application id (one per mounted job/executable).
pub type AppId = u32;
/// Client rank within its application on this node.
pub type ClientId = u32;
/// Delegator server rank.
pub type ServerRank = u32;
/// File id, first component of extent keys.
pub type Fid = u64;
/// Globally unique file id keying the attribute index.
pub type Gfid = i32;
/// Request-manager thread id, unique per mounted client on a delegator.
pub type ThreadId = u32;

/// Wire error codes carried in reply headers and RPC responses.
pub mod errcode {
    /// Success.
    pub const OK: i32 = 0;
    /// Attribute lookup for unknown gfid.
    pub const NOT_FOUND: i32 = 2;
    /// Underlying KV store failure.
    pub const KV: i32 = 5;
    /// Allocation or capacity failure.
    pub const NO_MEM: i32 = 12;
    /// Null or oversize input.
    pub const BAD_REQUEST: i32 = 22;
    /// RPC failed or timed out.
    pub const TRANSPORT: i32 = 32;
    /// Operation observed the exit flag.
    pub const SHUTDOWN: i32 = 108;
}

/// Max filename length stored in an attribute record.
pub const MAX_PATH_LEN: usize = 4096;

/// Byte width of an index record in the superblock.
pub const INDEX_REC_LEN: usize = 32;
/// Byte width of an attribute record in the superblock.
pub const ATTR_REC_LEN: usize = 64 + MAX_PATH_LEN;
/// Byte width of a read request record in the request region.
pub const READ_REQ_LEN: usize = 24;
/// Byte width of a read reply header in the reply region.
pub const REPLY_HDR_LEN: usize = 32;

/// One write extent as recorded by the client at fsync time: `length` bytes
/// of file `fid` at logical offset `file_pos` live at log offset `mem_pos`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct IndexRecord {
    pub fid: Fid,
    pub file_pos: u64,
    pub mem_pos: u64,
    pub length: u64,
}

impl IndexRecord {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.fid.to_le_bytes());
        out[8..16].copy_from_slice(&self.file_pos.to_le_bytes());
        out[16..24].copy_from_slice(&self.mem_pos.to_le_bytes());
        out[24..32].copy_from_slice(&self.length.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, StagefsError> {
        if buf.len() < INDEX_REC_LEN {
            return Err(StagefsError::msg("index record truncated"));
        }
        Ok(IndexRecord {
            fid: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            file_pos: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            mem_pos: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            length: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        })
    }
}

/// One read request as placed by the client in its request region.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ReadRequest {
    pub fid: Fid,
    pub offset: u64,
    pub length: u64,
}

impl ReadRequest {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.fid.to_le_bytes());
        out[8..16].copy_from_slice(&self.offset.to_le_bytes());
        out[16..24].copy_from_slice(&self.length.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, StagefsError> {
        if buf.len() < READ_REQ_LEN {
            return Err(StagefsError::msg("read request record truncated"));
        }
        Ok(ReadRequest {
            fid: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            length: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        })
    }
}

/// Header of one read reply deposited in the reply region; `length` data
/// bytes follow the header when `errcode` is OK (unspecified otherwise).
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Default,
)]
pub struct ReplyHeader {
    pub fid: Fid,
    pub offset: u64,
    pub length: u64,
    pub errcode: i32,
}

impl ReplyHeader {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.fid.to_le_bytes());
        out[8..16].copy_from_slice(&self.offset.to_le_bytes());
        out[16..24].copy_from_slice(&self.length.to_le_bytes());
        out[24..28].copy_from_slice(&self.errcode.to_le_bytes());
        out[28..32].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, StagefsError> {
        if buf.len() < REPLY_HDR_LEN {
            return Err(StagefsError::msg("reply header truncated"));
        }
        Ok(ReplyHeader {
            fid: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            length: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            errcode: i32::from_le_bytes(buf[24..28].try_into().unwrap()),
        })
    }
}

/// Stat-like attributes kept per gfid; exactly one record per gfid with
/// last writer winning.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Default,
)]
pub struct FileAttr {
    pub gfid: Gfid,
    pub fid: Fid,
    pub filename: String,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileAttr {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.gfid.to_le_bytes());
        out[4..8].fill(0);
        out[8..16].copy_from_slice(&self.fid.to_le_bytes());
        out[16..24].copy_from_slice(&self.size.to_le_bytes());
        out[24..28].copy_from_slice(&self.mode.to_le_bytes());
        out[28..32].copy_from_slice(&self.uid.to_le_bytes());
        out[32..36].copy_from_slice(&self.gid.to_le_bytes());
        out[36..40].fill(0);
        out[40..48].copy_from_slice(&self.atime.to_le_bytes());
        out[48..56].copy_from_slice(&self.mtime.to_le_bytes());
        out[56..64].copy_from_slice(&self.ctime.to_le_bytes());
        let name = self.filename.as_bytes();
        let n = name.len().min(MAX_PATH_LEN - 1);
        out[64..64 + n].copy_from_slice(&name[..n]);
        out[64 + n..64 + MAX_PATH_LEN].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, StagefsError> {
        if buf.len() < ATTR_REC_LEN {
            return Err(StagefsError::msg("attribute record truncated"));
        }
        let name_bytes = &buf[64..64 + MAX_PATH_LEN];
        let name_end =
            name_bytes.iter().position(|&b| b == 0).unwrap_or(MAX_PATH_LEN);
        Ok(FileAttr {
            gfid: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            fid: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            size: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            mode: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            uid: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            gid: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            atime: i64::from_le_bytes(buf[40..48].try_into().unwrap()),
            mtime: i64::from_le_bytes(buf[48..56].try_into().unwrap()),
            ctime: i64::from_le_bytes(buf[56..64].try_into().unwrap()),
            filename: String::from_utf8_lossy(&name_bytes[..name_end])
                .into_owned(),
        })
    }
}

/// Region offsets and sizes of one client superblock, agreed between client
/// and delegator at mount time. All offsets are page-aligned; record arrays
/// start one page after their region's count word.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct SuperblockLayout {
    pub superblock_sz: usize,
    pub data_offset: usize,
    pub data_size: usize,
    pub meta_offset: usize,
    pub meta_size: usize,
    pub fmeta_offset: usize,
    pub fmeta_size: usize,
}

impl SuperblockLayout {
    /// Computes a layout for the given region sizes, page-aligning every
    /// boundary.
    pub fn compute(
        data_size: usize,
        meta_size: usize,
        fmeta_size: usize,
        page: usize,
    ) -> Self {
        let up = |x: usize| x.div_ceil(page) * page;
        let data_offset = page;
        let data_size = up(data_size);
        let meta_offset = data_offset + data_size;
        let meta_size = up(meta_size);
        let fmeta_offset = meta_offset + meta_size;
        let fmeta_size = up(fmeta_size);
        SuperblockLayout {
            superblock_sz: fmeta_offset + fmeta_size,
            data_offset,
            data_size,
            meta_offset,
            meta_size,
            fmeta_offset,
            fmeta_size,
        }
    }

    /// Number of index records the index region can hold (its count word
    /// occupies the first page).
    pub fn index_capacity(&self, page: usize) -> usize {
        self.meta_size.saturating_sub(page) / INDEX_REC_LEN
    }

    /// Number of attribute records the attribute region can hold.
    pub fn attr_capacity(&self, page: usize) -> usize {
        self.fmeta_size.saturating_sub(page) / ATTR_REC_LEN
    }
}

#[cfg(test)]
mod layout_tests {
    use super::*;

    #[test]
    fn attr_record_name_truncation() -> Result<(), StagefsError> {
        let attr = FileAttr {
            gfid: -77,
            fid: 9,
            filename: "x".repeat(2 * MAX_PATH_LEN),
            size: 123,
            ..Default::default()
        };
        let mut buf = vec![0u8; ATTR_REC_LEN];
        attr.encode(&mut buf);
        let back = FileAttr::decode(&buf)?;
        assert_eq!(back.gfid, -77);
        assert_eq!(back.filename.len(), MAX_PATH_LEN - 1);
        Ok(())
    }

    #[test]
    fn layout_page_alignment() {
        let layout = SuperblockLayout::compute(100_000, 5000, 9000, 4096);
        assert_eq!(layout.data_offset % 4096, 0);
        assert_eq!(layout.meta_offset % 4096, 0);
        assert_eq!(layout.fmeta_offset % 4096, 0);
        assert!(layout.data_size >= 100_000);
        assert_eq!(
            layout.superblock_sz,
            layout.fmeta_offset + layout.fmeta_size
        );
    }

    #[test]
    fn index_capacity_excludes_count_page() {
        let layout = SuperblockLayout::compute(4096, 4096 * 3, 4096, 4096);
        assert_eq!(layout.index_capacity(4096), 2 * 4096 / INDEX_REC_LEN);
    }
}
