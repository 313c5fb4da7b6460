//! Chunked Reader.
//!
//! Streams a CSV file in fixed-size windows of data rows. Every read is a
//! fresh pass over the file: records before the header row are skipped, the
//! header is decoded, and data rows before the window are skipped without
//! decoding. A window that does not decode under the primary encoding is
//! re-read under each remaining candidate in order.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::{
    encoding::{EncodingCandidate, first_success},
    error::IngestError,
    io_utils::{self, DEFAULT_CSV_DELIMITER},
};

/// Raw string records of one window, still keyed by source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub index: usize,
    /// First data row of the window (0-based, header excluded).
    pub start_row: usize,
    /// One past the last data row actually read.
    pub end_row: usize,
    pub headers: Vec<String>,
    pub records: Vec<Vec<String>>,
    pub encoding: EncodingCandidate,
}

impl RawChunk {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Reads the header record at `header_row`.
pub fn read_headers(path: &Path, header_row: usize, encoding: &EncodingCandidate) -> Result<Vec<String>> {
    let mut reader = io_utils::open_csv_reader_from_path(path, DEFAULT_CSV_DELIMITER)?;
    let mut record = csv::ByteRecord::new();
    let mut idx = 0usize;
    while reader
        .read_byte_record(&mut record)
        .with_context(|| format!("Reading {path:?}"))?
    {
        if idx == header_row {
            return io_utils::decode_headers(&record, encoding)
                .with_context(|| format!("Decoding header row {header_row} as {encoding}"));
        }
        idx += 1;
    }
    Err(anyhow::anyhow!(
        "{path:?} has no header row at index {header_row} ({idx} record(s))"
    ))
}

/// Counts data rows after the header, decoding every record to make sure the
/// count holds under `encoding`.
pub fn count_rows(path: &Path, header_row: usize, encoding: &EncodingCandidate) -> Result<usize> {
    let mut reader = io_utils::open_csv_reader_from_path(path, DEFAULT_CSV_DELIMITER)?;
    let mut record = csv::ByteRecord::new();
    let mut idx = 0usize;
    let mut rows = 0usize;
    while reader
        .read_byte_record(&mut record)
        .with_context(|| format!("Reading {path:?}"))?
    {
        if idx > header_row {
            io_utils::decode_record(&record, encoding)
                .with_context(|| format!("Decoding data row {rows} as {encoding}"))?;
            rows += 1;
        }
        idx += 1;
    }
    Ok(rows)
}

/// Reads up to `row_count` data rows starting at data row `start_row`.
pub fn read_chunk(
    path: &Path,
    start_row: usize,
    row_count: usize,
    header_row: usize,
    encoding: &EncodingCandidate,
) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut reader = io_utils::open_csv_reader_from_path(path, DEFAULT_CSV_DELIMITER)?;
    let mut record = csv::ByteRecord::new();
    let mut headers = None;
    let mut records = Vec::with_capacity(row_count);
    let end_row = start_row.saturating_add(row_count);
    let mut idx = 0usize;
    while reader
        .read_byte_record(&mut record)
        .with_context(|| format!("Reading {path:?}"))?
    {
        if idx == header_row {
            headers = Some(
                io_utils::decode_headers(&record, encoding)
                    .with_context(|| format!("Decoding header row {header_row} as {encoding}"))?,
            );
        } else if idx > header_row {
            let data_row = idx - header_row - 1;
            if data_row >= end_row {
                break;
            }
            if data_row >= start_row {
                let decoded = io_utils::decode_record(&record, encoding)
                    .with_context(|| format!("Decoding data row {data_row} as {encoding}"))?;
                records.push(decoded);
            }
        }
        idx += 1;
    }
    let headers = headers
        .ok_or_else(|| anyhow::anyhow!("{path:?} has no header row at index {header_row}"))?;
    Ok((headers, records))
}

/// A file plus its ordered encoding candidates, primary first.
#[derive(Debug, Clone)]
pub struct ChunkReader {
    path: PathBuf,
    header_row: usize,
    encodings: Vec<EncodingCandidate>,
}

impl ChunkReader {
    pub fn new(path: &Path, header_row: usize, encodings: Vec<EncodingCandidate>) -> Self {
        Self {
            path: path.to_path_buf(),
            header_row,
            encodings,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn primary(&self) -> Option<EncodingCandidate> {
        self.encodings.first().copied()
    }

    fn exhausted(&self, attempts: Vec<crate::error::EncodingAttempt>) -> IngestError {
        IngestError::EncodingExhausted {
            path: self.path.clone(),
            attempts,
        }
    }

    fn fell_back(&self, used: EncodingCandidate, what: &str) {
        if self.primary() != Some(used) {
            warn!(
                "Read of {} in {:?} fell back to encoding {}",
                what, self.path, used
            );
        }
    }

    pub fn headers(&self) -> Result<Vec<String>, IngestError> {
        let (headers, used) = first_success(&self.encodings, |encoding| {
            read_headers(&self.path, self.header_row, &encoding).map_err(|err| format!("{err:#}"))
        })
        .map_err(|attempts| self.exhausted(attempts))?;
        self.fell_back(used, "the header");
        Ok(headers)
    }

    pub fn count_rows(&self) -> Result<usize, IngestError> {
        let (rows, used) = first_success(&self.encodings, |encoding| {
            count_rows(&self.path, self.header_row, &encoding).map_err(|err| format!("{err:#}"))
        })
        .map_err(|attempts| self.exhausted(attempts))?;
        self.fell_back(used, "the row count");
        debug!("{:?} holds {} data row(s) under {}", self.path, rows, used);
        Ok(rows)
    }

    /// Reads one window, retrying it under each candidate encoding in order.
    pub fn read_chunk(
        &self,
        index: usize,
        start_row: usize,
        row_count: usize,
    ) -> Result<RawChunk, IngestError> {
        let ((headers, records), encoding) = first_success(&self.encodings, |encoding| {
            read_chunk(&self.path, start_row, row_count, self.header_row, &encoding)
                .map_err(|err| format!("{err:#}"))
        })
        .map_err(|attempts| self.exhausted(attempts))?;
        self.fell_back(encoding, &format!("chunk {index}"));
        Ok(RawChunk {
            index,
            start_row,
            end_row: start_row + records.len(),
            headers,
            records,
            encoding,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::encoding::{SHIFT_JIS_CANDIDATE, UTF8_CANDIDATE, default_candidates};

    fn write_bytes(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    fn numbered_csv(rows: usize) -> String {
        let mut text = String::from("id,name\n");
        for i in 0..rows {
            text.push_str(&format!("{i},row{i}\n"));
        }
        text
    }

    #[test]
    fn count_rows_excludes_header() {
        let file = write_bytes(numbered_csv(25).as_bytes());
        assert_eq!(count_rows(file.path(), 0, &UTF8_CANDIDATE).unwrap(), 25);
    }

    #[test]
    fn count_rows_handles_quoted_newlines() {
        let file = write_bytes(b"id,memo\n1,\"two\nlines\"\n2,x\n");
        assert_eq!(count_rows(file.path(), 0, &UTF8_CANDIDATE).unwrap(), 2);
    }

    #[test]
    fn read_chunk_returns_requested_window() {
        let file = write_bytes(numbered_csv(25).as_bytes());
        let (headers, records) = read_chunk(file.path(), 10, 10, 0, &UTF8_CANDIDATE).unwrap();
        assert_eq!(headers, vec!["id", "name"]);
        assert_eq!(records.len(), 10);
        assert_eq!(records[0], vec!["10", "row10"]);
        assert_eq!(records[9], vec!["19", "row19"]);

        let (_, tail) = read_chunk(file.path(), 20, 10, 0, &UTF8_CANDIDATE).unwrap();
        assert_eq!(tail.len(), 5);
    }

    #[test]
    fn header_row_override_skips_preamble() {
        let file = write_bytes(b"exported 2025-03-21\n\nid,name\n1,a\n2,b\n");
        let headers = read_headers(file.path(), 1, &UTF8_CANDIDATE).unwrap();
        assert_eq!(headers, vec!["id", "name"]);
        assert_eq!(count_rows(file.path(), 1, &UTF8_CANDIDATE).unwrap(), 2);
    }

    #[test]
    fn chunk_falls_back_to_next_candidate() {
        let (encoded, _, _) = encoding_rs::SHIFT_JIS.encode("応募ID,名前\n1,山田\n2,佐藤\n");
        let file = write_bytes(&encoded);
        let reader = ChunkReader::new(file.path(), 0, vec![UTF8_CANDIDATE, SHIFT_JIS_CANDIDATE]);
        let chunk = reader.read_chunk(0, 0, 10).unwrap();
        assert_eq!(chunk.encoding, SHIFT_JIS_CANDIDATE);
        assert_eq!(chunk.headers, vec!["応募ID", "名前"]);
        assert_eq!(chunk.records[1], vec!["2", "佐藤"]);
        assert_eq!((chunk.start_row, chunk.end_row), (0, 2));
    }

    #[test]
    fn exhaustion_reports_every_attempt() {
        let file = write_bytes(b"id\n\xFF\xFE\n");
        let reader = ChunkReader::new(file.path(), 0, vec![UTF8_CANDIDATE]);
        let err = reader.read_chunk(0, 0, 10).unwrap_err();
        match err {
            IngestError::EncodingExhausted { attempts, .. } => {
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].encoding, "UTF-8");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn default_candidates_always_read_something() {
        let file = write_bytes(b"id,name\n1,\xFF\x81\n");
        let reader = ChunkReader::new(file.path(), 0, default_candidates());
        let chunk = reader.read_chunk(0, 0, 10).unwrap();
        assert_eq!(chunk.len(), 1);
        assert_eq!(reader.count_rows().unwrap(), 1);
    }
}
