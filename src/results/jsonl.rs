//! Streaming JSONL writer with append / in-place-replace semantics (§4.6).
//!
//! Each entity occupies exactly one record in the file. The first write for
//! an entity appends; every subsequent write for the same entity rewrites
//! its record at the same offset. Fixtures and tests can be live at once
//! (§4.5/§5), so a rewrite is not always the last record in the file: when
//! it isn't, the bytes after it (other entities' records) are preserved by
//! shifting them to follow the new, possibly differently-sized, record.
//! This keeps the file parseable line-by-line even if the process crashes
//! mid-run, since the last write for every entity reflects its latest known
//! state.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::entity::EntityResult;

pub struct JsonlWriter {
    file: std::fs::File,
    /// Byte offset and encoded length of each entity's current record.
    records: HashMap<String, (u64, u64)>,
    /// Current end-of-file offset, i.e. where the next new record starts.
    cursor: u64,
}

impl JsonlWriter {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(JsonlWriter {
            file,
            records: HashMap::new(),
            cursor: 0,
        })
    }

    /// Writes (or rewrites) `result`'s record. Entities are keyed by name;
    /// a second write for the same name rewrites in place. If the record is
    /// the file's tail, it's a plain seek-truncate-rewrite; otherwise the
    /// trailing bytes (other entities' records) are read out, the new
    /// record is written in the old one's place, and the trailing bytes are
    /// rewritten after it, with every later entity's recorded offset
    /// shifted by the size delta.
    pub fn write(&mut self, result: &EntityResult) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(result)?;
        line.push(b'\n');
        let new_len = line.len() as u64;

        match self.records.get(&result.entity.name).copied() {
            Some((offset, old_len)) => {
                let old_end = offset + old_len;
                if old_end == self.cursor {
                    self.file.seek(SeekFrom::Start(offset))?;
                    self.file.write_all(&line)?;
                    self.file.set_len(offset + new_len)?;
                    self.cursor = offset + new_len;
                } else {
                    let tail_len = self.cursor - old_end;
                    let mut tail = vec![0u8; tail_len as usize];
                    self.file.seek(SeekFrom::Start(old_end))?;
                    self.file.read_exact(&mut tail)?;

                    self.file.seek(SeekFrom::Start(offset))?;
                    self.file.write_all(&line)?;
                    self.file.write_all(&tail)?;
                    let new_cursor = offset + new_len + tail_len;
                    self.file.set_len(new_cursor)?;
                    self.cursor = new_cursor;

                    let delta = new_len as i64 - old_len as i64;
                    for (rec_offset, _) in self.records.values_mut() {
                        if *rec_offset > offset {
                            *rec_offset = (*rec_offset as i64 + delta) as u64;
                        }
                    }
                }
                self.records.insert(result.entity.name.clone(), (offset, new_len));
            }
            None => {
                self.file.seek(SeekFrom::Start(self.cursor))?;
                self.file.write_all(&line)?;
                self.records.insert(result.entity.name.clone(), (self.cursor, new_len));
                self.cursor += new_len;
            }
        }
        self.file.flush()?;
        Ok(())
    }
}
