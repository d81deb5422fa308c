//! Record framing
//!
//! Every record on disk is `{start_marker(4)}{length(4 LE)}{payload}`. The
//! start marker distinguishes live records from deleted ones, and deletion
//! happens by overwriting the marker in place. Recovery scans tolerate
//! arbitrary corruption between records: unknown bytes are skipped one at a
//! time until the next plausible marker, with a single warning per gap.

use std::io::{self, Read, Write};

/// Marker opening a live record
pub const LIVE_MARKER: [u8; 4] = [0x00, 0x00, 0xFF, 0x01];

/// Marker opening a deleted record
pub const DELETED_MARKER: [u8; 4] = [0x00, 0x00, 0x01, 0xFF];

/// Bytes of marker plus length field preceding each payload
pub const FRAME_HEADER_LEN: u64 = 8;

/// Write one live record
pub fn write_record<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&LIVE_MARKER)?;
    writer.write_all(&(payload.len() as i32).to_le_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

/// One record located by a recovery scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedRecord {
    /// Byte offset of the start marker
    pub position: u64,
    /// Payload length
    pub length: u32,
    /// True when the marker says deleted
    pub deleted: bool,
}

/// Scan a whole stream for records. Corrupt spans are skipped byte by byte
/// and logged once per gap; a record truncated at the tail is dropped with
/// a warning. Never fails on content, only on I/O.
pub fn scan<R: Read>(reader: &mut R, label: &str) -> io::Result<Vec<ScannedRecord>> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut gap_start: Option<usize> = None;

    while offset + FRAME_HEADER_LEN as usize <= data.len() {
        let marker = &data[offset..offset + 4];
        let deleted = marker == DELETED_MARKER;
        if marker != LIVE_MARKER && !deleted {
            gap_start.get_or_insert(offset);
            offset += 1;
            continue;
        }

        let length =
            i32::from_le_bytes(data[offset + 4..offset + 8].try_into().expect("4 bytes"));
        if length <= 0 {
            // a marker with a nonsense length is corruption too
            gap_start.get_or_insert(offset);
            offset += 1;
            continue;
        }
        let length = length as usize;
        if offset + FRAME_HEADER_LEN as usize + length > data.len() {
            tracing::warn!(
                label,
                position = offset,
                length,
                "dropping record truncated at end of queue file"
            );
            close_gap(&mut gap_start, offset, label);
            return Ok(records);
        }

        close_gap(&mut gap_start, offset, label);
        records.push(ScannedRecord {
            position: offset as u64,
            length: length as u32,
            deleted,
        });
        offset += FRAME_HEADER_LEN as usize + length;
    }

    if offset < data.len() {
        gap_start.get_or_insert(offset);
    }
    close_gap(&mut gap_start, data.len(), label);
    Ok(records)
}

fn close_gap(gap_start: &mut Option<usize>, end: usize, label: &str) {
    if let Some(start) = gap_start.take() {
        tracing::warn!(
            label,
            start,
            bytes = end - start,
            "skipped corrupt span while recovering queue file"
        );
    }
}
