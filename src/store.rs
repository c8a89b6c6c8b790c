/// Store represents a file where records are stored.
use std::{
  fs::File,
  io::{BufWriter, Write},
  os::unix::prelude::FileExt,
  sync::Mutex,
};

use anyhow::Result;

static LEN_WIDTH: u64 = 8;

#[derive(Debug)]
pub struct Store {
  /// File is wrapped in a BufWriter because it can be inefficient
  /// to work directly with something that implements Write
  /// because it may issue too many systems calls.
  ///
  /// BufWriter will keep an in-memory buffer of data
  /// and write it to the underlying writer in batches.
  writer: Mutex<BufWriter<File>>,
  /// Total number of bytes written to the store, including length
  /// prefixes. Doubles as the position the next append will start at.
  size: Mutex<u64>,
}

impl Store {
  pub fn new(file: File) -> Result<Self> {
    let size = file.metadata()?.len();

    Ok(Self {
      writer: Mutex::new(BufWriter::new(file)),
      size: Mutex::new(size),
    })
  }

  /// Appends `buffer` as a length-prefixed record and returns
  /// `(bytes_written, position)`, where `position` is where the
  /// entry starts (the position callers must hand to `read`).
  pub fn append(&self, buffer: &[u8]) -> Result<(u64, u64)> {
    let mut writer = self.writer.lock().unwrap();
    let mut size = self.size.lock().unwrap();

    let position = *size;

    writer.write_all(&(buffer.len() as u64).to_be_bytes())?;
    writer.write_all(buffer)?;

    let bytes_written = LEN_WIDTH + buffer.len() as u64;
    *size += bytes_written;

    Ok((bytes_written, position))
  }

  /// Reads the record whose length prefix starts at `position`.
  /// Callers guarantee `position` is the start of a valid entry.
  pub fn read(&self, position: u64) -> Result<Vec<u8>> {
    // Flush BufWriter to ensure that content has been written to the
    // underlying file before we read it.
    let mut writer = self.writer.lock().unwrap();
    writer.flush()?;

    let file = writer.get_ref();

    let mut len_buffer = [0u8; LEN_WIDTH as usize];
    file.read_exact_at(&mut len_buffer, position)?;
    let len = u64::from_be_bytes(len_buffer);

    let mut payload = vec![0u8; len as usize];
    file.read_exact_at(&mut payload, position + LEN_WIDTH)?;

    Ok(payload)
  }

  /// Positional bulk read used by the replicated log's snapshot reader.
  pub fn read_at(&self, buffer: &mut [u8], position: u64) -> std::io::Result<usize> {
    let mut writer = self.writer.lock().unwrap();
    writer.flush()?;

    let file = writer.get_ref();

    file.read_at(buffer, position)
  }

  pub fn flush(&self) -> Result<(), std::io::Error> {
    let mut writer = self.writer.lock().unwrap();

    writer.flush()
  }

  /// Total bytes written so far, including length prefixes.
  pub fn size(&self) -> u64 {
    *self.size.lock().unwrap()
  }

  pub fn close(&self) -> Result<()> {
    self.flush()?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::NamedTempFile;

  fn write_store() -> (Store, [&'static [u8]; 3]) {
    let file = NamedTempFile::new().unwrap().into_file();
    let store = Store::new(file).unwrap();

    let records: [&[u8]; 3] = [b"first", b"second record", b"3"];

    (store, records)
  }

  #[test]
  fn append_returns_bytes_written_and_position() {
    let (store, records) = write_store();

    let mut expected_position = 0u64;

    for record in records {
      let (bytes_written, position) = store.append(record).unwrap();

      assert_eq!(expected_position, position);
      assert_eq!(LEN_WIDTH + record.len() as u64, bytes_written);

      expected_position += bytes_written;
    }

    assert_eq!(expected_position, store.size());
  }

  #[test]
  fn read_returns_the_payload_written_at_append() {
    let (store, records) = write_store();

    let mut positions = vec![];

    for record in records {
      let (_, position) = store.append(record).unwrap();
      positions.push(position);
    }

    for (record, position) in records.iter().zip(positions) {
      assert_eq!(record.to_vec(), store.read(position).unwrap());
    }
  }

  #[test]
  fn read_at_reads_raw_bytes_across_record_boundaries() {
    let (store, records) = write_store();

    for record in records {
      store.append(record).unwrap();
    }

    let mut buffer = vec![0u8; store.size() as usize];
    let n = store.read_at(&mut buffer, 0).unwrap();

    assert_eq!(store.size() as usize, n);
  }
}
