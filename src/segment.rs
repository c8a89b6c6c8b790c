use std::fs::OpenOptions;

use anyhow::Result;
use prost::Message;

use crate::{
  api::v1::{Record, RecordType},
  index::{self, Index},
  store::Store,
};

/// The segment wraps the index and store types to coordinate operations
/// across the two.
///
/// When the log appends a record to the active segment,
/// the segment needs to write the data to its store and add
/// a new entry in the index.
///
/// For reads, the segment needs to lookup the entry from the index
/// and then fetch the data from the store.

#[derive(Debug, Clone, Copy)]
pub struct Config {
  pub max_index_bytes: u64,
  pub max_store_bytes: u64,
  pub initial_offset: u64,
}

#[derive(Debug)]
pub struct Segment {
  store: Store,
  index: Index,
  dir: String,
  base_offset: u64,
  next_offset: u64,
  config: Config,
}

impl Segment {
  pub fn new(dir: &str, base_offset: u64, config: Config) -> Result<Self> {
    let store_file = OpenOptions::new()
      .create(true)
      .read(true)
      .append(true)
      .open(format!("{}/{}.store", dir, base_offset))?;

    let store = Store::new(store_file)?;

    let index_file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(format!("{}/{}.index", dir, base_offset))?;

    let index = Index::new(
      index_file,
      index::Config {
        max_index_bytes: config.max_index_bytes,
      },
    )?;

    // If the index already has entries, resume numbering from the last one.
    // Otherwise this is a brand new segment and offsets start at base_offset.
    let next_offset = match index.read(-1) {
      Ok((relative_offset, _)) => base_offset + relative_offset as u64 + 1,
      Err(_) => base_offset,
    };

    Ok(Self {
      store,
      index,
      dir: dir.to_string(),
      base_offset,
      next_offset,
      config,
    })
  }

  pub fn base_offset(&self) -> u64 {
    self.base_offset
  }

  pub fn next_offset(&self) -> u64 {
    self.next_offset
  }

  pub fn store_path(&self) -> String {
    format!("{}/{}.store", self.dir, self.base_offset)
  }

  pub fn store_size(&self) -> u64 {
    self.store.size()
  }

  /// Appends `value` as the next record, assigning it `next_offset`.
  /// Returns the assigned offset.
  pub fn append(&mut self, value: Vec<u8>) -> Result<u64> {
    self.append_record(Record {
      offset: 0,
      term: 0,
      value,
      record_type: RecordType::Append as i32,
    })
  }

  /// Appends a fully-formed record (used by the replicated log's state
  /// machine, which already decided `term`/`record_type`). `offset` is
  /// always overwritten with this segment's `next_offset`.
  pub fn append_record(&mut self, mut record: Record) -> Result<u64> {
    let offset = self.next_offset;
    record.offset = offset;

    let encoded = record.encode_to_vec();

    let (_, position) = self.store.append(&encoded)?;

    self
      .index
      .write((offset - self.base_offset) as u32, position)?;

    self.next_offset += 1;

    Ok(offset)
  }

  pub fn read(&self, offset: u64) -> Result<Record> {
    let (_, position) = self.index.read((offset - self.base_offset) as i64)?;

    let payload = self.store.read(position)?;

    Ok(Record::decode(payload.as_slice())?)
  }

  /// A segment is maxed when either file has reached its configured cap, or
  /// the index has no room for another entry.
  pub fn is_maxed(&self) -> bool {
    self.store.size() >= self.config.max_store_bytes
      || self.index.is_maxed()
  }

  pub fn close(self) -> Result<()> {
    self.store.close()?;
    self.index.close()?;

    Ok(())
  }

  pub fn remove(self) -> Result<()> {
    let store_path = format!("{}/{}.store", self.dir, self.base_offset);
    let index_path = format!("{}/{}.index", self.dir, self.base_offset);

    self.close()?;

    std::fs::remove_file(&store_path)?;
    std::fs::remove_file(&index_path)?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(max_store_bytes: u64, max_index_bytes: u64) -> Config {
    Config {
      max_store_bytes,
      max_index_bytes,
      initial_offset: 0,
    }
  }

  #[test]
  fn append_assigns_sequential_offsets_starting_at_base_offset() {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path().to_str().unwrap();

    let mut segment = Segment::new(dir, 16, config(1024, 1024)).unwrap();

    assert_eq!(16, segment.append(b"a".to_vec()).unwrap());
    assert_eq!(17, segment.append(b"b".to_vec()).unwrap());
    assert_eq!(18, segment.next_offset());
  }

  #[test]
  fn read_returns_the_value_that_was_appended() {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path().to_str().unwrap();

    let mut segment = Segment::new(dir, 0, config(1024, 1024)).unwrap();

    let offset = segment.append(b"hello".to_vec()).unwrap();

    assert_eq!(b"hello".to_vec(), segment.read(offset).unwrap().value);
  }

  #[test]
  fn is_maxed_when_store_bytes_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path().to_str().unwrap();

    // Each record encodes to a handful of bytes; a tiny cap maxes out fast.
    let mut segment = Segment::new(dir, 0, config(16, 1024)).unwrap();

    assert!(!segment.is_maxed());

    segment.append(vec![0u8; 16]).unwrap();

    assert!(segment.is_maxed());
  }

  #[test]
  fn is_maxed_when_index_is_full() {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path().to_str().unwrap();

    // An index with room for exactly one entry maxes out after one append.
    let mut segment = Segment::new(dir, 0, config(1024, 12)).unwrap();

    assert!(!segment.is_maxed());

    segment.append(b"a".to_vec()).unwrap();

    assert!(segment.is_maxed());
  }

  #[test]
  fn reopening_a_segment_resumes_next_offset_from_the_index_tail() {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path().to_str().unwrap();

    {
      let mut segment = Segment::new(dir, 0, config(1024, 1024)).unwrap();
      segment.append(b"a".to_vec()).unwrap();
      segment.append(b"b".to_vec()).unwrap();
      segment.close().unwrap();
    }

    let reopened = Segment::new(dir, 0, config(1024, 1024)).unwrap();

    assert_eq!(2, reopened.next_offset());
  }
}
