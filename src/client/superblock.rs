//! Client-side superblock: the data log and the staged record regions.
//!
//! The client appends write data into the in-memory log region of its
//! named superblock; once that fills, whole chunks go to the spill file
//! (an extent never straddles the log/spill boundary, so the service
//! manager can satisfy any fetch from exactly one of the two). Log
//! positions address the logical concatenation of log then spill file.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::common::{
    layout::{ATTR_REC_LEN, INDEX_REC_LEN},
    FileAttr, IndexRecord, SuperblockLayout,
};
use crate::utils::{ShmRegion, StagefsError};

/// Owner-side view of one superblock region plus its spill files.
pub struct SuperblockWriter {
    layout: SuperblockLayout,
    page: usize,

    region: ShmRegion,

    spill_data: File,
    spill_index: File,
    spill_sz: usize,

    /// Next append position in the logical log (in-memory then spill).
    log_pos: u64,
}

impl SuperblockWriter {
    /// Creates the named superblock region and fresh spill files.
    pub fn create(
        super_name: &str,
        layout: SuperblockLayout,
        page: usize,
        spill_data_path: &Path,
        spill_index_path: &Path,
        spill_sz: usize,
    ) -> Result<Self, StagefsError> {
        let region = ShmRegion::create(super_name, layout.superblock_sz)?;
        let spill_data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(spill_data_path)?;
        let spill_index = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(spill_index_path)?;

        Ok(SuperblockWriter {
            layout,
            page,
            region,
            spill_data,
            spill_index,
            spill_sz,
            log_pos: 0,
        })
    }

    pub fn layout(&self) -> &SuperblockLayout {
        &self.layout
    }

    /// Bytes of log space already consumed.
    pub fn log_pos(&self) -> u64 {
        self.log_pos
    }

    /// Appends one write's data to the log, returning its log position.
    /// Chunks that no longer fit the in-memory region go wholly to the
    /// spill file.
    pub fn append_data(&mut self, data: &[u8]) -> Result<u64, StagefsError> {
        let data_size = self.layout.data_size as u64;
        let len = data.len() as u64;

        if self.log_pos < data_size && self.log_pos + len > data_size {
            // never straddle the boundary; the slack at the end of the
            // in-memory log is simply left unused
            self.log_pos = data_size;
        }

        let pos = self.log_pos;
        if pos < data_size {
            self.region.write_at(
                self.layout.data_offset + pos as usize,
                data,
            )?;
        } else {
            let spill_off = pos - data_size;
            if spill_off + len > self.spill_sz as u64 {
                return Err(StagefsError(format!(
                    "spill file full: {} + {} > {}",
                    spill_off, len, self.spill_sz
                )));
            }
            self.spill_data.write_all_at(data, spill_off)?;
        }

        self.log_pos = pos + len;
        Ok(pos)
    }

    /// Stages coalesced index records into the index region: count word at
    /// `meta_offset`, record array one page later.
    pub fn stage_index_records(
        &self,
        records: &[IndexRecord],
    ) -> Result<(), StagefsError> {
        if records.len() > self.layout.index_capacity(self.page) {
            return Err(StagefsError(format!(
                "{} index records exceed region capacity {}",
                records.len(),
                self.layout.index_capacity(self.page)
            )));
        }
        let base = self.layout.meta_offset + self.page;
        let mut rec = [0u8; INDEX_REC_LEN];
        for (i, record) in records.iter().enumerate() {
            record.encode(&mut rec);
            self.region.write_at(base + i * INDEX_REC_LEN, &rec)?;
        }
        self.region
            .write_u64(self.layout.meta_offset, records.len() as u64)
    }

    /// Stages attribute records into the attribute region.
    pub fn stage_attr_records(
        &self,
        attrs: &[FileAttr],
    ) -> Result<(), StagefsError> {
        if attrs.len() > self.layout.attr_capacity(self.page) {
            return Err(StagefsError(format!(
                "{} attr records exceed region capacity {}",
                attrs.len(),
                self.layout.attr_capacity(self.page)
            )));
        }
        let base = self.layout.fmeta_offset + self.page;
        let mut rec = vec![0u8; ATTR_REC_LEN];
        for (i, attr) in attrs.iter().enumerate() {
            attr.encode(&mut rec);
            self.region.write_at(base + i * ATTR_REC_LEN, &rec)?;
        }
        self.region
            .write_u64(self.layout.fmeta_offset, attrs.len() as u64)
    }

    /// Persists staged index records to the spill index log, so data that
    /// reached the local node survives a delegator restart within the job.
    pub fn persist_index_records(
        &mut self,
        records: &[IndexRecord],
    ) -> Result<(), StagefsError> {
        let mut buf = Vec::with_capacity(records.len() * INDEX_REC_LEN);
        let mut rec = [0u8; INDEX_REC_LEN];
        for record in records {
            record.encode(&mut rec);
            buf.extend_from_slice(&rec);
        }
        use std::io::Write;
        self.spill_index.write_all(&buf)?;
        self.spill_index.sync_data()?;
        Ok(())
    }

    /// Flushes spilled data to disk; called before the fsync RPC so an
    /// acknowledged fsync means "persisted to local spill plus KV store".
    pub fn flush_spill(&self) -> Result<(), StagefsError> {
        self.spill_data.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod superblock_tests {
    use super::*;
    use crate::utils::page_size;

    fn temp_paths(tag: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let dir = std::env::temp_dir();
        (
            dir.join(format!("stagefs-spill-{}-{}.data", tag,
                             std::process::id())),
            dir.join(format!("stagefs-spill-{}-{}.index", tag,
                             std::process::id())),
        )
    }

    #[test]
    fn append_spills_without_straddling() -> Result<(), StagefsError> {
        let page = page_size();
        let layout = SuperblockLayout::compute(page, page, page, page);
        let (data_path, index_path) = temp_paths("straddle");
        let mut writer = SuperblockWriter::create(
            &format!("stagefs-test-super-{}", std::process::id()),
            layout,
            page,
            &data_path,
            &index_path,
            1 << 20,
        )?;

        // fill most of the in-memory log
        let first = writer.append_data(&vec![7u8; page - 100])?;
        assert_eq!(first, 0);

        // this one cannot fit the tail, so it must start at the boundary
        let second = writer.append_data(&vec![9u8; 200])?;
        assert_eq!(second, layout.data_size as u64);

        // spilled bytes land at the start of the spill file
        let mut back = vec![0u8; 200];
        writer.spill_data.read_exact_at(&mut back, 0)?;
        assert_eq!(back, vec![9u8; 200]);

        std::fs::remove_file(&data_path).ok();
        std::fs::remove_file(&index_path).ok();
        Ok(())
    }

    #[test]
    fn staged_records_round_trip() -> Result<(), StagefsError> {
        let page = page_size();
        let layout =
            SuperblockLayout::compute(page, 3 * page, 3 * page, page);
        let (data_path, index_path) = temp_paths("stage");
        let writer = SuperblockWriter::create(
            &format!("stagefs-test-stage-{}", std::process::id()),
            layout,
            page,
            &data_path,
            &index_path,
            1 << 20,
        )?;

        let records = vec![
            IndexRecord {
                fid: 7,
                file_pos: 0,
                mem_pos: 0,
                length: 64,
            },
            IndexRecord {
                fid: 7,
                file_pos: 64,
                mem_pos: 64,
                length: 64,
            },
        ];
        writer.stage_index_records(&records)?;

        assert_eq!(writer.region.read_u64(layout.meta_offset)?, 2);
        let mut rec = [0u8; INDEX_REC_LEN];
        writer.region.read_at(
            layout.meta_offset + page + INDEX_REC_LEN,
            &mut rec,
        )?;
        assert_eq!(IndexRecord::decode(&rec)?, records[1]);

        std::fs::remove_file(&data_path).ok();
        std::fs::remove_file(&index_path).ok();
        Ok(())
    }
}
