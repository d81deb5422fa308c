//! # Dream Queue
//!
//! Transactional record queues for durable, at-least-once work handoff.
//! Producers append framed records; consumers read without deleting and
//! acknowledge with an explicit delete carrying the record's opaque
//! handle, so a crash between read and delete re-delivers the record on
//! recovery. Two implementations share one contract: a single backing file
//! ([`SingleFileQueueStream`]) and a directory of bounded files
//! ([`MultiFileQueueStream`]).
//!
//! Queue streams are single-writer, single-reader per instance; callers
//! sharing one instance synchronize externally.

pub mod framing;
mod multi_file;
mod single_file;

pub use multi_file::{MultiFileQueueStream, DEFAULT_MAX_FILE_SIZE};
pub use single_file::SingleFileQueueStream;

use bytes::Bytes;
use dream_core::Result;

/// Opaque handle binding a read record to its queue and generation.
/// Handles from a prior generation (before a truncation) are silently
/// ignored by [`QueueStream::delete_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHandle {
    pub(crate) generation: u64,
    pub(crate) file_id: u32,
    pub(crate) position: u64,
}

/// One record returned by [`QueueStream::read_next_record`]
#[derive(Debug, Clone)]
pub struct QueueRecord {
    /// Record payload
    pub payload: Bytes,
    /// Handle for the eventual delete
    pub handle: RecordHandle,
}

/// Contract shared by the queue stream implementations
pub trait QueueStream: Send {
    /// Append a framed record; once this returns, the record is visible to
    /// reads in FIFO order within the current generation
    fn append_record(&mut self, payload: &[u8]) -> Result<()>;

    /// Dequeue the next unread record without deleting it; `None` when the
    /// queue holds no pending records
    fn read_next_record(&mut self) -> Result<Option<QueueRecord>>;

    /// Mark a record deleted. Idempotent; handles from a prior generation
    /// are ignored.
    fn delete_record(&mut self, handle: RecordHandle) -> Result<()>;

    /// Drop every record and bump the generation
    fn truncate(&mut self) -> Result<()>;

    /// Number of pending (not yet read) records; records read but not
    /// deleted are not counted
    fn unread_count(&self) -> usize;
}
