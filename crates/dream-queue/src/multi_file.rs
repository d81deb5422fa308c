//! Multi-file queue stream
//!
//! Records are spread over a directory of `data_<id>.bin` files with
//! monotonically increasing ids. Writes always land in the current head
//! file; once the head crosses the size bound a new head is created. A
//! non-head file whose records have all been deleted is removed outright,
//! and when the head is the sole remaining file and empties, it is
//! truncated in place and its id reset to 1 so ids never grow without
//! bound.

use crate::framing::{self, DELETED_MARKER, FRAME_HEADER_LEN};
use crate::{QueueRecord, QueueStream, RecordHandle};
use bytes::Bytes;
use dream_core::{Error, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Default bound on a single data file
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug)]
struct QueueFile {
    file: File,
    path: PathBuf,
    size: u64,
    live: HashMap<u64, u32>,
}

/// Append-only queue stream over a directory of bounded files
#[derive(Debug)]
pub struct MultiFileQueueStream {
    dir: PathBuf,
    max_file_size: u64,
    files: BTreeMap<u32, QueueFile>,
    head_id: u32,
    pending: VecDeque<(u32, u64)>,
    generation: u64,
}

impl MultiFileQueueStream {
    /// Open or create the queue directory, recovering live records from
    /// every data file in ascending id order
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_max_file_size(dir, DEFAULT_MAX_FILE_SIZE)
    }

    /// Open with an explicit file-size bound
    pub fn open_with_max_file_size(dir: impl AsRef<Path>, max_file_size: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(id) = parse_file_id(&entry.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut files = BTreeMap::new();
        let mut pending = VecDeque::new();
        for id in &ids {
            let queue_file = open_file(&dir, *id)?;
            for position in sorted_positions(&queue_file.live) {
                pending.push_back((*id, position));
            }
            files.insert(*id, queue_file);
        }

        let head_id = match ids.last() {
            Some(id) => *id,
            None => {
                files.insert(1, create_file(&dir, 1)?);
                1
            }
        };

        Ok(Self {
            dir,
            max_file_size,
            files,
            head_id,
            pending,
            generation: 1,
        })
    }

    /// Queue directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current handle generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of data files currently backing the queue
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    fn roll_head(&mut self) -> Result<()> {
        let next = self.head_id + 1;
        self.files.insert(next, create_file(&self.dir, next)?);
        self.head_id = next;
        Ok(())
    }

    /// When the head is the sole remaining file and holds no live records,
    /// reclaim it: truncate in place and reset its id to 1 so ids never
    /// grow without bound
    fn reclaim_sole_head(&mut self) -> Result<()> {
        if self.files.len() != 1 {
            return Ok(());
        }
        let head = self.files.get(&self.head_id).expect("sole file is the head");
        if !head.live.is_empty() || (head.size == 0 && self.head_id == 1) {
            return Ok(());
        }
        let removed = self.files.remove(&self.head_id).expect("entry exists");
        drop(removed.file);
        std::fs::remove_file(&removed.path)?;
        self.files.insert(1, create_file(&self.dir, 1)?);
        self.head_id = 1;
        self.pending.clear();
        self.generation += 1;
        Ok(())
    }
}

impl QueueStream for MultiFileQueueStream {
    fn append_record(&mut self, payload: &[u8]) -> Result<()> {
        let head_full = self
            .files
            .get(&self.head_id)
            .is_some_and(|head| head.size >= self.max_file_size);
        if head_full {
            self.roll_head()?;
        }

        let head_id = self.head_id;
        let head = self.files.get_mut(&head_id).expect("head file exists");
        let position = head.size;
        head.file.seek(SeekFrom::Start(position))?;
        framing::write_record(&mut head.file, payload)?;
        head.file.flush()?;
        head.size = position + FRAME_HEADER_LEN + payload.len() as u64;
        head.live.insert(position, payload.len() as u32);
        self.pending.push_back((head_id, position));
        Ok(())
    }

    fn read_next_record(&mut self) -> Result<Option<QueueRecord>> {
        let Some((file_id, position)) = self.pending.pop_front() else {
            return Ok(None);
        };
        let queue_file = self
            .files
            .get_mut(&file_id)
            .ok_or_else(|| Error::corruption(format!("pending record in missing file {file_id}")))?;
        let length = *queue_file.live.get(&position).expect("pending record is live");
        queue_file.file.seek(SeekFrom::Start(position + FRAME_HEADER_LEN))?;
        let mut payload = vec![0u8; length as usize];
        queue_file.file.read_exact(&mut payload)?;
        Ok(Some(QueueRecord {
            payload: Bytes::from(payload),
            handle: RecordHandle {
                generation: self.generation,
                file_id,
                position,
            },
        }))
    }

    fn delete_record(&mut self, handle: RecordHandle) -> Result<()> {
        if handle.generation != self.generation {
            return Ok(());
        }
        let Some(queue_file) = self.files.get_mut(&handle.file_id) else {
            return Ok(());
        };
        if queue_file.live.remove(&handle.position).is_none() {
            return Ok(());
        }
        queue_file.file.seek(SeekFrom::Start(handle.position))?;
        queue_file.file.write_all(&DELETED_MARKER)?;
        queue_file.file.flush()?;

        if !queue_file.live.is_empty() {
            return Ok(());
        }
        if handle.file_id != self.head_id {
            // a drained non-head file is dead weight
            let removed = self.files.remove(&handle.file_id).expect("entry exists");
            drop(removed.file);
            std::fs::remove_file(&removed.path)?;
            tracing::debug!(path = %removed.path.display(), "removed drained queue file");
        }
        // either this delete drained the head, or removing a sibling just
        // left an already-drained head as the sole file
        self.reclaim_sole_head()
    }

    fn truncate(&mut self) -> Result<()> {
        for (_, queue_file) in std::mem::take(&mut self.files) {
            drop(queue_file.file);
            std::fs::remove_file(&queue_file.path)?;
        }
        self.files.insert(1, create_file(&self.dir, 1)?);
        self.head_id = 1;
        self.pending.clear();
        self.generation += 1;
        Ok(())
    }

    fn unread_count(&self) -> usize {
        self.pending.len()
    }
}

fn file_name(id: u32) -> String {
    format!("data_{id}.bin")
}

fn parse_file_id(name: &str) -> Option<u32> {
    let id = name.strip_prefix("data_")?.strip_suffix(".bin")?;
    let id: u32 = id.parse().ok()?;
    (id > 0).then_some(id)
}

fn create_file(dir: &Path, id: u32) -> Result<QueueFile> {
    let path = dir.join(file_name(id));
    let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
    Ok(QueueFile {
        file,
        path,
        size: 0,
        live: HashMap::new(),
    })
}

fn open_file(dir: &Path, id: u32) -> Result<QueueFile> {
    let path = dir.join(file_name(id));
    let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
    let label = path.display().to_string();
    file.seek(SeekFrom::Start(0))?;
    let scanned = framing::scan(&mut file, &label)?;

    let mut size = 0;
    let mut live = HashMap::new();
    for record in &scanned {
        size = record.position + FRAME_HEADER_LEN + u64::from(record.length);
        if !record.deleted {
            live.insert(record.position, record.length);
        }
    }
    Ok(QueueFile {
        file,
        path,
        size,
        live,
    })
}

fn sorted_positions(live: &HashMap<u64, u32>) -> Vec<u64> {
    let mut positions: Vec<u64> = live.keys().copied().collect();
    positions.sort_unstable();
    positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_file_ids() {
        assert_eq!(parse_file_id("data_1.bin"), Some(1));
        assert_eq!(parse_file_id("data_42.bin"), Some(42));
        assert_eq!(parse_file_id("data_0.bin"), None);
        assert_eq!(parse_file_id("data_x.bin"), None);
        assert_eq!(parse_file_id("other.bin"), None);
    }

    #[test]
    fn rollover_creates_new_head() {
        let dir = tempdir().unwrap();
        let mut queue =
            MultiFileQueueStream::open_with_max_file_size(dir.path(), 64).unwrap();
        queue.append_record(&[1u8; 60]).unwrap();
        assert_eq!(queue.file_count(), 1);
        queue.append_record(&[2u8; 60]).unwrap();
        assert_eq!(queue.file_count(), 2);
        assert!(dir.path().join("data_1.bin").exists());
        assert!(dir.path().join("data_2.bin").exists());
    }

    #[test]
    fn fifo_spans_files() {
        let dir = tempdir().unwrap();
        let mut queue =
            MultiFileQueueStream::open_with_max_file_size(dir.path(), 32).unwrap();
        for n in 0..5u8 {
            queue.append_record(&[n; 30]).unwrap();
        }
        for n in 0..5u8 {
            let record = queue.read_next_record().unwrap().unwrap();
            assert_eq!(record.payload.as_ref(), &[n; 30]);
        }
        assert!(queue.read_next_record().unwrap().is_none());
    }

    #[test]
    fn drained_non_head_file_is_removed() {
        let dir = tempdir().unwrap();
        let mut queue =
            MultiFileQueueStream::open_with_max_file_size(dir.path(), 32).unwrap();
        queue.append_record(&[1u8; 30]).unwrap();
        queue.append_record(&[2u8; 30]).unwrap();
        assert_eq!(queue.file_count(), 2);

        let first = queue.read_next_record().unwrap().unwrap();
        queue.delete_record(first.handle).unwrap();
        assert_eq!(queue.file_count(), 1);
        assert!(!dir.path().join("data_1.bin").exists());
        assert!(dir.path().join("data_2.bin").exists());
    }

    #[test]
    fn sole_head_resets_to_id_one() {
        let dir = tempdir().unwrap();
        let mut queue =
            MultiFileQueueStream::open_with_max_file_size(dir.path(), 32).unwrap();
        queue.append_record(&[1u8; 30]).unwrap();
        queue.append_record(&[2u8; 30]).unwrap();

        let first = queue.read_next_record().unwrap().unwrap();
        let second = queue.read_next_record().unwrap().unwrap();
        queue.delete_record(first.handle).unwrap();
        queue.delete_record(second.handle).unwrap();

        assert_eq!(queue.file_count(), 1);
        assert!(dir.path().join("data_1.bin").exists());
        assert!(!dir.path().join("data_2.bin").exists());
        assert_eq!(std::fs::metadata(dir.path().join("data_1.bin")).unwrap().len(), 0);
    }

    #[test]
    fn head_drained_before_sibling_is_still_reclaimed() {
        let dir = tempdir().unwrap();
        let mut queue =
            MultiFileQueueStream::open_with_max_file_size(dir.path(), 60).unwrap();
        // one record per file: a -> data_1, b -> data_2, c -> data_3 (head)
        for payload in [b"a", b"b", b"c"] {
            queue.append_record(&[payload[0]; 55]).unwrap();
        }
        assert_eq!(queue.file_count(), 3);

        let a = queue.read_next_record().unwrap().unwrap();
        let b = queue.read_next_record().unwrap().unwrap();
        let c = queue.read_next_record().unwrap().unwrap();

        // drain the head while data_1 still holds a live record
        queue.delete_record(b.handle).unwrap();
        queue.delete_record(c.handle).unwrap();
        assert_eq!(queue.file_count(), 2);
        assert!(dir.path().join("data_3.bin").exists());

        // removing the last sibling leaves a drained sole head: reclaim it
        queue.delete_record(a.handle).unwrap();
        assert_eq!(queue.file_count(), 1);
        assert!(!dir.path().join("data_3.bin").exists());
        assert!(dir.path().join("data_1.bin").exists());
        assert_eq!(std::fs::metadata(dir.path().join("data_1.bin")).unwrap().len(), 0);

        // ids start from 1 again for new traffic
        queue.append_record(b"fresh").unwrap();
        let fresh = queue.read_next_record().unwrap().unwrap();
        assert_eq!(fresh.payload.as_ref(), b"fresh");
    }

    #[test]
    fn truncate_invalidates_handles() {
        let dir = tempdir().unwrap();
        let mut queue = MultiFileQueueStream::open(dir.path()).unwrap();
        queue.append_record(b"r1").unwrap();
        let record = queue.read_next_record().unwrap().unwrap();

        queue.truncate().unwrap();
        queue.append_record(b"r2").unwrap();
        queue.delete_record(record.handle).unwrap();
        let next = queue.read_next_record().unwrap().unwrap();
        assert_eq!(next.payload.as_ref(), b"r2");
    }
}
