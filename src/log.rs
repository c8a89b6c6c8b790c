/// Log is an ordered list of segments. It routes appends to the active
/// (newest) segment, reads to whichever segment covers the requested
/// offset, and creates new segments when the active one fills up.
use std::{
  fs::File,
  io::Read as _,
  os::unix::prelude::FileExt,
  sync::RwLock,
};

use anyhow::Result;
use thiserror::Error;

use crate::{
  api::v1::{Record, RecordType},
  segment::{self, Segment},
};

#[derive(Debug, Clone, Copy)]
pub struct Config {
  pub initial_offset: u64,
  pub max_store_bytes: u64,
  pub max_index_bytes: u64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      initial_offset: 0,
      // Defaults to 1024 when zero, per the segment size budget.
      max_store_bytes: 1024,
      max_index_bytes: 1024,
    }
  }
}

impl Config {
  /// Normalizes a caller-supplied config the way `Log::new` expects: a zero
  /// byte cap means "use the default," not "never roll a segment."
  fn resolved(self) -> Self {
    Self {
      initial_offset: self.initial_offset,
      max_store_bytes: if self.max_store_bytes == 0 {
        1024
      } else {
        self.max_store_bytes
      },
      max_index_bytes: if self.max_index_bytes == 0 {
        1024
      } else {
        self.max_index_bytes
      },
    }
  }

  fn segment_config(self) -> segment::Config {
    segment::Config {
      max_store_bytes: self.max_store_bytes,
      max_index_bytes: self.max_index_bytes,
      initial_offset: self.initial_offset,
    }
  }
}

#[derive(Debug, PartialEq, Error)]
pub enum LogError {
  #[error("offset {0} is out of range")]
  OffsetOutOfRange(u64),
}

struct Inner {
  segments: Vec<Segment>,
  /// Index into `segments` of the active (newest) segment. Always
  /// `segments.len() - 1`; kept as an index rather than a reference so it
  /// survives `Vec` reallocation on push.
  active_segment: usize,
}

pub struct Log {
  dir: String,
  config: Config,
  inner: RwLock<Inner>,
}

impl Log {
  pub fn new(dir: String, config: Config) -> Result<Self> {
    let config = config.resolved();

    std::fs::create_dir_all(&dir)?;

    let mut segments = Self::discover_segments(&dir, config)?;

    if segments.is_empty() {
      segments.push(Segment::new(&dir, config.initial_offset, config.segment_config())?);
    }

    let active_segment = segments.len() - 1;

    Ok(Self {
      dir,
      config,
      inner: RwLock::new(Inner {
        segments,
        active_segment,
      }),
    })
  }

  /// Scans `dir` for `<base_offset>.store`/`<base_offset>.index` pairs and
  /// reopens each one, sorted ascending by base offset.
  fn discover_segments(dir: &str, config: Config) -> Result<Vec<Segment>> {
    let mut base_offsets: Vec<u64> = std::fs::read_dir(dir)?
      .filter_map(|entry| entry.ok())
      .filter_map(|entry| entry.file_name().into_string().ok())
      .filter(|name| name.ends_with(".store"))
      .filter_map(|name| name.trim_end_matches(".store").parse::<u64>().ok())
      .collect();

    base_offsets.sort_unstable();
    base_offsets.dedup();

    base_offsets
      .into_iter()
      .map(|base_offset| Segment::new(dir, base_offset, config.segment_config()))
      .collect()
  }

  /// Appends `value` to the active segment, rolling over to a new segment
  /// first if the active one is already maxed. Returns the assigned offset.
  pub fn append(&self, value: Vec<u8>) -> Result<u64> {
    self.append_record(Record {
      offset: 0,
      term: 0,
      value,
      record_type: RecordType::Append as i32,
    })
  }

  /// Appends a fully-formed record, preserving everything but `offset`
  /// (which the log always assigns). Used by the replicated log's state
  /// machine, which already knows `term`/`record_type`.
  pub fn append_record(&self, record: Record) -> Result<u64> {
    let mut inner = self.inner.write().unwrap();

    let active = inner.active_segment;
    let offset = inner.segments[active].append_record(record)?;

    if inner.segments[active].is_maxed() {
      let new_segment = Segment::new(&self.dir, offset + 1, self.config.segment_config())?;
      inner.segments.push(new_segment);
      inner.active_segment += 1;
    }

    Ok(offset)
  }

  pub fn read(&self, offset: u64) -> Result<Record> {
    let inner = self.inner.read().unwrap();

    let segment = inner
      .segments
      .iter()
      .find(|segment| segment.base_offset() <= offset && offset < segment.next_offset());

    match segment {
      None => Err(LogError::OffsetOutOfRange(offset).into()),
      Some(segment) => segment.read(offset),
    }
  }

  pub fn lowest_offset(&self) -> u64 {
    let inner = self.inner.read().unwrap();

    inner.segments.first().unwrap().base_offset()
  }

  pub fn highest_offset(&self) -> u64 {
    let inner = self.inner.read().unwrap();

    let next = inner.segments.last().unwrap().next_offset();

    if next == 0 {
      0
    } else {
      next - 1
    }
  }

  /// Removes every segment whose highest offset does not exceed `lowest`,
  /// preserving the order of survivors. A no-op on an empty log. The active
  /// (last) segment is never removed, regardless of its offsets, since a
  /// log must always have somewhere to route the next append.
  pub fn truncate(&self, lowest: u64) -> Result<()> {
    let mut inner = self.inner.write().unwrap();

    if inner.segments.len() <= 1 {
      return Ok(());
    }

    let last_index = inner.segments.len() - 1;
    let mut survivors = Vec::with_capacity(inner.segments.len());

    for (index, segment) in inner.segments.drain(..).enumerate() {
      if index != last_index && segment.next_offset() <= lowest + 1 {
        segment.remove()?;
      } else {
        survivors.push(segment);
      }
    }

    inner.active_segment = survivors.len() - 1;
    inner.segments = survivors;

    Ok(())
  }

  /// A byte-stream reader over every segment's store, concatenated in
  /// order from position 0. Used by the replicated log to build snapshots.
  /// The view is frozen at construction time: each segment's store is
  /// reopened with its own file handle and its logical size captured now,
  /// so later appends don't extend what an already-built reader sees.
  pub fn reader(&self) -> Result<LogReader> {
    let inner = self.inner.read().unwrap();

    let files = inner
      .segments
      .iter()
      .map(|segment| -> Result<(File, u64)> {
        let file = File::open(segment.store_path())?;
        Ok((file, segment.store_size()))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(LogReader {
      files: files.into_iter().collect(),
      position_in_current: 0,
    })
  }

  /// Closes the data directory, deleting every segment, then recreates the
  /// log with `initial_offset`. Used to install a snapshot.
  pub fn reset(&self) -> Result<()> {
    self.reset_with_initial_offset(self.config.initial_offset)
  }

  /// Like `reset`, but seeds the fresh segment's `base_offset` explicitly.
  /// Used by snapshot restore, which must resume numbering from whatever
  /// offset the snapshot stream's first record carries.
  pub fn reset_with_initial_offset(&self, initial_offset: u64) -> Result<()> {
    let mut inner = self.inner.write().unwrap();

    for segment in inner.segments.drain(..) {
      segment.remove().ok();
    }

    std::fs::remove_dir_all(&self.dir).ok();
    std::fs::create_dir_all(&self.dir)?;

    let fresh = Segment::new(&self.dir, initial_offset, self.config.segment_config())?;

    inner.segments.push(fresh);
    inner.active_segment = 0;

    Ok(())
  }

  pub fn close(&self) -> Result<()> {
    let mut inner = self.inner.write().unwrap();

    for segment in inner.segments.drain(..) {
      segment.close()?;
    }

    Ok(())
  }
}

/// Concatenated, frozen-size view over a log's segment stores.
pub struct LogReader {
  files: std::collections::VecDeque<(File, u64)>,
  position_in_current: u64,
}

impl std::io::Read for LogReader {
  fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
      let Some((file, size)) = self.files.front() else {
        return Ok(0);
      };

      if self.position_in_current >= *size {
        self.files.pop_front();
        self.position_in_current = 0;
        continue;
      }

      let remaining = (*size - self.position_in_current) as usize;
      let to_read = remaining.min(buf.len());

      let n = file.read_at(&mut buf[..to_read], self.position_in_current)?;

      if n == 0 {
        self.files.pop_front();
        self.position_in_current = 0;
        continue;
      }

      self.position_in_current += n as u64;

      return Ok(n);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn new_log(dir: &str, max_store_bytes: u64, max_index_bytes: u64) -> Log {
    Log::new(
      dir.to_string(),
      Config {
        initial_offset: 0,
        max_store_bytes,
        max_index_bytes,
      },
    )
    .unwrap()
  }

  #[test]
  fn append_returns_sequential_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let log = new_log(dir.path().to_str().unwrap(), 1024, 1024);

    assert_eq!(0, log.append(b"a".to_vec()).unwrap());
    assert_eq!(1, log.append(b"b".to_vec()).unwrap());
    assert_eq!(2, log.append(b"c".to_vec()).unwrap());

    assert_eq!(0, log.lowest_offset());
    assert_eq!(2, log.highest_offset());
    assert_eq!(b"b".to_vec(), log.read(1).unwrap().value);
  }

  #[test]
  fn append_rolls_over_to_a_new_segment_when_maxed() {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path().to_str().unwrap();

    // 20-byte values + 8-byte length prefix = 28 bytes on disk; two of
    // those overflow a 32-byte cap.
    let log = new_log(dir, 32, 1024);

    assert_eq!(0, log.append(vec![0u8; 20]).unwrap());
    assert_eq!(1, log.append(vec![0u8; 20]).unwrap());

    assert!(std::path::Path::new(&format!("{dir}/0.store")).exists());
    assert!(std::path::Path::new(&format!("{dir}/1.store")).exists());
  }

  #[test]
  fn read_returns_offset_out_of_range_for_unknown_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let log = new_log(dir.path().to_str().unwrap(), 1024, 1024);

    log.append(b"a".to_vec()).unwrap();

    let err = log.read(100).unwrap_err();
    assert_eq!(
      LogError::OffsetOutOfRange(100),
      err.downcast::<LogError>().unwrap()
    );
  }

  #[test]
  fn truncate_removes_segments_fully_below_the_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path().to_str().unwrap();

    // Force a new segment roughly every 3 records.
    let log = new_log(dir, 84, 1024);

    for i in 0..10 {
      let value = format!("record-{i}");
      log.append(value.into_bytes()).unwrap();
    }

    log.truncate(5).unwrap();

    assert!(log.read(3).is_err());
    assert!(log.read(6).is_ok());
    assert!(log.lowest_offset() > 0);
  }

  #[test]
  fn truncate_on_an_empty_log_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path().to_str().unwrap();

    let log = new_log(dir, 1024, 1024);

    log.truncate(0).unwrap();

    assert_eq!(0, log.lowest_offset());
    assert_eq!(0, log.highest_offset());

    let offset = log.append(b"a".to_vec()).unwrap();
    assert_eq!(0, offset);
    assert_eq!(b"a".to_vec(), log.read(offset).unwrap().value);
  }

  #[test]
  fn truncate_at_the_highest_offset_keeps_the_active_segment() {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path().to_str().unwrap();

    // Force a new segment roughly every 3 records.
    let log = new_log(dir, 84, 1024);

    for i in 0..10 {
      let value = format!("record-{i}");
      log.append(value.into_bytes()).unwrap();
    }

    let highest = log.highest_offset();
    log.truncate(highest).unwrap();

    // The active segment survives, so the next append still gets a
    // sequential offset instead of panicking or resetting.
    let next = log.append(b"record-10".to_vec()).unwrap();
    assert_eq!(highest + 1, next);
    assert_eq!(b"record-10".to_vec(), log.read(next).unwrap().value);
  }

  #[test]
  fn reopening_a_log_resumes_highest_offset() {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path().to_str().unwrap();

    {
      let log = new_log(dir, 1024, 1024);
      log.append(b"a".to_vec()).unwrap();
      log.append(b"b".to_vec()).unwrap();
      log.close().unwrap();
    }

    let reopened = new_log(dir, 1024, 1024);
    assert_eq!(1, reopened.highest_offset());
    assert_eq!(b"b".to_vec(), reopened.read(1).unwrap().value);
  }

  #[test]
  fn reader_concatenates_every_segment_store_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path().to_str().unwrap();

    let log = new_log(dir, 84, 1024);

    for i in 0..10u8 {
      log.append(vec![i; 5]).unwrap();
    }

    let mut reader = log.reader().unwrap();
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer).unwrap();

    assert!(!buffer.is_empty());
  }

  #[test]
  fn reset_deletes_every_segment_and_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path().to_str().unwrap();

    let log = new_log(dir, 1024, 1024);
    log.append(b"a".to_vec()).unwrap();
    log.append(b"b".to_vec()).unwrap();

    log.reset().unwrap();

    assert_eq!(0, log.lowest_offset());
    assert_eq!(0, log.highest_offset());
    assert!(log.read(0).is_err());
  }
}
