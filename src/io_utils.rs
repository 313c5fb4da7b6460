//! CSV reader construction and strict field decoding.
//!
//! Records are parsed at the byte level and decoded field by field. The
//! candidate encodings are all ASCII-compatible with no multi-byte sequence
//! containing `,`, `"` or a line break, so the record structure does not depend
//! on the encoding and only decoding can fail between candidates.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use anyhow::{Context, Result, anyhow};

use crate::encoding::EncodingCandidate;

pub const DEFAULT_CSV_DELIMITER: u8 = b',';

/// Builds a header-less, flexible reader; header handling is left to the caller
/// so a header row other than the first record can be honoured.
pub fn open_csv_reader<R>(reader: R, delimiter: u8) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(false)
        .delimiter(delimiter)
        .double_quote(true)
        .flexible(true);
    builder.from_reader(reader)
}

pub fn open_csv_reader_from_path(path: &Path, delimiter: u8) -> Result<csv::Reader<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("Opening input file {path:?}"))?;
    Ok(open_csv_reader(BufReader::new(file), delimiter))
}

pub fn decode_bytes(bytes: &[u8], encoding: &EncodingCandidate) -> Result<String> {
    encoding
        .decode_strict(bytes)
        .map(|text| text.into_owned())
        .ok_or_else(|| anyhow!("Failed to decode text with encoding {encoding}"))
}

pub fn decode_record(record: &csv::ByteRecord, encoding: &EncodingCandidate) -> Result<Vec<String>> {
    record
        .iter()
        .map(|field| decode_bytes(field, encoding))
        .collect()
}

/// Decodes a header record, dropping a byte-order mark left on the first name.
pub fn decode_headers(record: &csv::ByteRecord, encoding: &EncodingCandidate) -> Result<Vec<String>> {
    let mut headers = decode_record(record, encoding)?;
    if let Some(first) = headers.first_mut()
        && let Some(stripped) = first.strip_prefix('\u{FEFF}')
    {
        *first = stripped.to_string();
    }
    Ok(headers)
}
