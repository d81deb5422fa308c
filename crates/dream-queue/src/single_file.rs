//! Single-file queue stream
//!
//! One append-only file holds every record. Reads dequeue without
//! deleting; an explicit [`delete_record`](crate::QueueStream::delete_record)
//! with the read handle overwrites the record's start marker. When the last
//! live record is deleted the file is truncated to zero and the generation
//! is bumped, invalidating any outstanding handles.

use crate::framing::{self, DELETED_MARKER, FRAME_HEADER_LEN};
use crate::{QueueRecord, QueueStream, RecordHandle};
use bytes::Bytes;
use dream_core::Result;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Append-only queue stream over a single backing file
#[derive(Debug)]
pub struct SingleFileQueueStream {
    file: File,
    path: PathBuf,
    pending: VecDeque<u64>,
    live: HashMap<u64, u32>,
    generation: u64,
    write_pos: u64,
}

impl SingleFileQueueStream {
    /// Open or create the backing file, recovering any live records
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file =
            OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        let label = path.display().to_string();
        file.seek(SeekFrom::Start(0))?;
        let scanned = framing::scan(&mut file, &label)?;

        let mut pending = VecDeque::new();
        let mut live = HashMap::new();
        let mut write_pos = 0;
        for record in &scanned {
            write_pos = record.position + FRAME_HEADER_LEN + u64::from(record.length);
            if !record.deleted {
                pending.push_back(record.position);
                live.insert(record.position, record.length);
            }
        }

        Ok(Self {
            file,
            path,
            pending,
            live,
            generation: 1,
            write_pos,
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current handle generation; bumped by truncation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn reset_file(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.write_pos = 0;
        self.generation += 1;
        Ok(())
    }
}

impl QueueStream for SingleFileQueueStream {
    fn append_record(&mut self, payload: &[u8]) -> Result<()> {
        let position = self.write_pos;
        self.file.seek(SeekFrom::Start(position))?;
        framing::write_record(&mut self.file, payload)?;
        self.file.flush()?;
        self.write_pos = position + FRAME_HEADER_LEN + payload.len() as u64;
        self.pending.push_back(position);
        self.live.insert(position, payload.len() as u32);
        Ok(())
    }

    fn read_next_record(&mut self) -> Result<Option<QueueRecord>> {
        let Some(position) = self.pending.pop_front() else {
            return Ok(None);
        };
        let length = *self.live.get(&position).expect("pending record is live");
        self.file.seek(SeekFrom::Start(position + FRAME_HEADER_LEN))?;
        let mut payload = vec![0u8; length as usize];
        std::io::Read::read_exact(&mut self.file, &mut payload)?;
        Ok(Some(QueueRecord {
            payload: Bytes::from(payload),
            handle: RecordHandle {
                generation: self.generation,
                file_id: 0,
                position,
            },
        }))
    }

    fn delete_record(&mut self, handle: RecordHandle) -> Result<()> {
        // a handle from before a truncation refers to nothing anymore
        if handle.generation != self.generation {
            return Ok(());
        }
        if self.live.remove(&handle.position).is_none() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(handle.position))?;
        self.file.write_all(&DELETED_MARKER)?;
        self.file.flush()?;
        if self.live.is_empty() {
            // nothing live and nothing pending: reclaim the file
            self.pending.clear();
            self.reset_file()?;
        }
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        self.pending.clear();
        self.live.clear();
        self.reset_file()
    }

    fn unread_count(&self) -> usize {
        self.pending.len()
    }
}
