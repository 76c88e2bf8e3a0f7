//! Fixed-record header files.
//!
//! Every header file is a flat array of 120-byte records indexed by
//! height offset from the chain's forkpoint. Legacy headers are stored
//! zero-padded to the record size; an all-zero record marks a gap.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use corvid_consensus::constants::EXTENDED_HEADER_SIZE;

pub const RECORD_SIZE: usize = EXTENDED_HEADER_SIZE;

#[derive(Clone, Debug)]
pub struct HeaderFile {
    path: PathBuf,
}

impl HeaderFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn create(&self) -> std::io::Result<()> {
        File::create(&self.path)?;
        Ok(())
    }

    pub fn delete(&self) -> std::io::Result<()> {
        std::fs::remove_file(&self.path)
    }

    /// Grow the file (sparsely) to hold at least `records` records.
    pub fn preallocate(&self, records: u32) -> std::io::Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.path)?;
        let wanted = u64::from(records) * RECORD_SIZE as u64;
        if file.metadata()?.len() < wanted {
            file.set_len(wanted)?;
        }
        Ok(())
    }

    /// Number of whole records in the file; zero when absent.
    pub fn record_count(&self) -> std::io::Result<u32> {
        if !self.path.exists() {
            return Ok(0);
        }
        let len = std::fs::metadata(&self.path)?.len();
        Ok((len / RECORD_SIZE as u64) as u32)
    }

    /// Read one record. `None` for records beyond the end or stored as
    /// all zeros.
    pub fn read_record(&self, index: u32) -> std::io::Result<Option<[u8; RECORD_SIZE]>> {
        if index >= self.record_count()? {
            return Ok(None);
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(index as u64 * RECORD_SIZE as u64))?;
        let mut record = [0u8; RECORD_SIZE];
        file.read_exact(&mut record)?;
        if record.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub fn read_records(&self, index: u32, count: u32) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(index as u64 * RECORD_SIZE as u64))?;
        let mut data = vec![0u8; count as usize * RECORD_SIZE];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    pub fn read_all(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }

    /// Write record-aligned data at a record offset. With `truncate`
    /// set, anything past the written range is dropped unless the write
    /// is a pure append.
    pub fn write_records(&self, index: u32, data: &[u8], truncate: bool) -> std::io::Result<()> {
        debug_assert_eq!(data.len() % RECORD_SIZE, 0);
        let offset = index as u64 * RECORD_SIZE as u64;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        if truncate && offset != file.metadata()?.len() {
            file.set_len(offset)?;
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = HeaderFile::new(dir.path().join("headers"));
        assert_eq!(file.record_count().unwrap(), 0);
        assert_eq!(file.read_record(0).unwrap(), None);
    }

    #[test]
    fn sparse_writes_leave_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let file = HeaderFile::new(dir.path().join("headers"));
        let record = [7u8; RECORD_SIZE];
        // write record 2 first, records 0..2 read back as absent
        file.write_records(2, &record, false).unwrap();
        file.write_records(0, &record, false).unwrap();
        assert_eq!(file.record_count().unwrap(), 3);
        assert!(file.read_record(0).unwrap().is_some());
        assert_eq!(file.read_record(1).unwrap(), None);
        assert!(file.read_record(2).unwrap().is_some());
    }

    #[test]
    fn truncating_write_drops_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let file = HeaderFile::new(dir.path().join("headers"));
        let record = [7u8; RECORD_SIZE];
        for index in 0..4 {
            file.write_records(index, &record, true).unwrap();
        }
        assert_eq!(file.record_count().unwrap(), 4);
        file.write_records(1, &[9u8; RECORD_SIZE], true).unwrap();
        assert_eq!(file.record_count().unwrap(), 2);
        assert_eq!(file.read_record(1).unwrap(), Some([9u8; RECORD_SIZE]));
    }
}
