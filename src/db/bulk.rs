//! Sorted-run files for bulk loading.
//!
//! A run file is a magic header followed by key-ordered, varint-length-
//! prefixed `(key, value)` records. Partition migration writes the moved
//! records into a run under a shared staging directory and hands the
//! directory path to the receiving server, which ingests every run it finds
//! there (the `Bukin` operation).

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{FsError, FsResult};
use crate::keys::{get_varint, put_varint};

const RUN_MAGIC: &[u8; 8] = b"GIGARUN1";

/// Extension of run files inside a staging directory.
pub const RUN_EXT: &str = "run";

/// Streaming writer enforcing strict key order.
pub struct BulkWriter {
    file: BufWriter<File>,
    last_key: Option<Vec<u8>>,
    n: u64,
}

impl BulkWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> FsResult<Self> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(RUN_MAGIC)?;
        Ok(Self {
            file,
            last_key: None,
            n: 0,
        })
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> FsResult<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(FsError::InvalidArgument(
                    "run keys must be added in strictly increasing order".to_string(),
                ));
            }
        }
        let mut rec = Vec::with_capacity(key.len() + value.len() + 10);
        put_varint(&mut rec, key.len() as u64);
        rec.extend_from_slice(key);
        put_varint(&mut rec, value.len() as u64);
        rec.extend_from_slice(value);
        self.file.write_all(&rec)?;
        self.last_key = Some(key.to_vec());
        self.n += 1;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn finish(mut self) -> FsResult<u64> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(self.n)
    }
}

/// Read a whole run file back into memory.
pub fn read_run<P: AsRef<Path>>(path: P) -> FsResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut raw = Vec::new();
    BufReader::new(File::open(&path)?).read_to_end(&mut raw)?;
    if raw.len() < RUN_MAGIC.len() || &raw[..RUN_MAGIC.len()] != RUN_MAGIC {
        return Err(FsError::Corruption(format!(
            "{} is not a run file",
            path.as_ref().display()
        )));
    }
    let mut cursor = &raw[RUN_MAGIC.len()..];
    let mut entries = Vec::new();
    while !cursor.is_empty() {
        let key = read_record(&mut cursor, &path)?;
        let value = read_record(&mut cursor, &path)?;
        entries.push((key, value));
    }
    Ok(entries)
}

fn read_record<P: AsRef<Path>>(cursor: &mut &[u8], path: &P) -> FsResult<Vec<u8>> {
    let truncated = || {
        FsError::Corruption(format!(
            "truncated run file {}",
            path.as_ref().display()
        ))
    };
    let len = get_varint(cursor).ok_or_else(truncated)? as usize;
    if cursor.len() < len {
        return Err(truncated());
    }
    let (head, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(head.to_vec())
}

/// Load every run file in `dir`, merged into one key-ordered entry list.
/// Later runs win on duplicate keys.
pub fn load_dir<P: AsRef<Path>>(dir: P) -> FsResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|e| e == RUN_EXT).unwrap_or(false))
        .collect();
    paths.sort();
    let mut entries = Vec::new();
    for path in paths {
        entries.extend(read_run(&path)?);
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries.dedup_by(|later, earlier| {
        // stable sort keeps file order within equal keys
        later.0 == earlier.0 && {
            std::mem::swap(earlier, later);
            true
        }
    });
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.run");
        let mut writer = BulkWriter::create(&path).unwrap();
        writer.add(b"a", b"1").unwrap();
        writer.add(b"b", b"2").unwrap();
        writer.add(b"c", b"3").unwrap();
        assert_eq!(writer.finish().unwrap(), 3);

        let entries = read_run(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], (b"a".to_vec(), b"1".to_vec()));
        assert_eq!(entries[2], (b"c".to_vec(), b"3".to_vec()));
    }

    #[test]
    fn test_out_of_order_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BulkWriter::create(dir.path().join("x.run")).unwrap();
        writer.add(b"b", b"2").unwrap();
        assert!(writer.add(b"a", b"1").is_err());
        assert!(writer.add(b"b", b"2").is_err());
    }

    #[test]
    fn test_load_dir_merges_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut w1 = BulkWriter::create(dir.path().join("01.run")).unwrap();
        w1.add(b"a", b"old").unwrap();
        w1.add(b"c", b"3").unwrap();
        w1.finish().unwrap();
        let mut w2 = BulkWriter::create(dir.path().join("02.run")).unwrap();
        w2.add(b"a", b"new").unwrap();
        w2.add(b"b", b"2").unwrap();
        w2.finish().unwrap();
        // Non-run files are ignored.
        std::fs::write(dir.path().join("notes.txt"), b"skip me").unwrap();

        let entries = load_dir(dir.path()).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], (b"a".to_vec(), b"new".to_vec()));
        assert_eq!(entries[1].0, b"b".to_vec());
    }

    #[test]
    fn test_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.run");
        std::fs::write(&path, b"not a run").unwrap();
        assert!(matches!(read_run(&path), Err(FsError::Corruption(_))));
    }
}
