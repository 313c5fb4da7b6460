//! Encoding detection for incoming report files.
//!
//! Files arrive in whatever encoding the dashboard export used, most often a
//! Japanese double-byte encoding. Detection probe-decodes a prefix of the file
//! under an ordered list of candidates and picks the first one that decodes
//! cleanly. The list ends with `windows-1252`, which maps every byte, so
//! detection with the default list always returns *some* encoding even when
//! the text will come out garbled. Ingestion never aborts on encoding alone.
//!
//! The same ordered list drives the chunk reader's fallback re-reads through
//! [`first_success`].

use std::{
    fmt,
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use encoding_rs::{DecoderResult, EUC_JP, Encoding, SHIFT_JIS, UTF_8, WINDOWS_1252};
use log::{debug, info};

use crate::error::{EncodingAttempt, IngestError, Result};

/// Number of leading bytes decoded when probing a large file.
pub const PROBE_BYTES: usize = 64 * 1024;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// One entry of the ordered candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingCandidate {
    pub label: &'static str,
    pub encoding: &'static Encoding,
    /// The candidate only applies to input that starts with a UTF-8 byte-order mark.
    pub bom: bool,
}

impl EncodingCandidate {
    pub const fn new(label: &'static str, encoding: &'static Encoding) -> Self {
        Self {
            label,
            encoding,
            bom: false,
        }
    }

    /// Looks up a candidate by any WHATWG label (`cp932`, `sjis`, `utf-8`, `euc-jp`, ...).
    pub fn for_label(label: &str) -> Option<Self> {
        let trimmed = label.trim();
        if trimmed.eq_ignore_ascii_case("utf-8-sig") || trimmed.eq_ignore_ascii_case("utf-8-bom") {
            return Some(UTF8_BOM_CANDIDATE);
        }
        // Python-style codec name with no WHATWG label.
        if trimmed.eq_ignore_ascii_case("cp932") {
            return Some(SHIFT_JIS_CANDIDATE);
        }
        let encoding = Encoding::for_label(trimmed.as_bytes())?;
        Some(
            default_candidates()
                .into_iter()
                .find(|candidate| candidate.encoding == encoding && !candidate.bom)
                .unwrap_or(EncodingCandidate::new(encoding.name(), encoding)),
        )
    }

    /// Decodes `bytes` without replacement characters, failing on the first malformed sequence.
    pub fn decode_strict<'a>(&self, bytes: &'a [u8]) -> Option<std::borrow::Cow<'a, str>> {
        let payload = if self.bom {
            bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes)
        } else {
            bytes
        };
        self.encoding
            .decode_without_bom_handling_and_without_replacement(payload)
    }

    /// Returns whether `bytes` decode cleanly. When `complete` is false the input
    /// is a prefix and a sequence cut off at the end is not counted as an error.
    pub fn probe(&self, bytes: &[u8], complete: bool) -> bool {
        let payload = if self.bom {
            match bytes.strip_prefix(UTF8_BOM) {
                Some(rest) => rest,
                None => return false,
            }
        } else {
            bytes
        };
        let mut decoder = self.encoding.new_decoder_without_bom_handling();
        let Some(capacity) = decoder.max_utf8_buffer_length_without_replacement(payload.len())
        else {
            return false;
        };
        let mut output = String::with_capacity(capacity);
        let (result, _read) =
            decoder.decode_to_string_without_replacement(payload, &mut output, complete);
        matches!(result, DecoderResult::InputEmpty)
    }
}

impl fmt::Display for EncodingCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label)
    }
}

pub const SHIFT_JIS_CANDIDATE: EncodingCandidate = EncodingCandidate::new("Shift_JIS", SHIFT_JIS);
pub const UTF8_CANDIDATE: EncodingCandidate = EncodingCandidate::new("UTF-8", UTF_8);
pub const UTF8_BOM_CANDIDATE: EncodingCandidate = EncodingCandidate {
    label: "UTF-8-BOM",
    encoding: UTF_8,
    bom: true,
};
pub const EUC_JP_CANDIDATE: EncodingCandidate = EncodingCandidate::new("EUC-JP", EUC_JP);
pub const FALLBACK_CANDIDATE: EncodingCandidate =
    EncodingCandidate::new("windows-1252", WINDOWS_1252);

/// Legacy double-byte first, then UTF-8 variants, EUC, and the byte-preserving fallback.
pub fn default_candidates() -> Vec<EncodingCandidate> {
    vec![
        SHIFT_JIS_CANDIDATE,
        UTF8_CANDIDATE,
        UTF8_BOM_CANDIDATE,
        EUC_JP_CANDIDATE,
        FALLBACK_CANDIDATE,
    ]
}

/// How the run picks its primary encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingChoice {
    #[default]
    Auto,
    Fixed(EncodingCandidate),
}

impl EncodingChoice {
    pub fn parse(value: &str) -> Result<Self> {
        if value.trim().eq_ignore_ascii_case("auto") {
            return Ok(EncodingChoice::Auto);
        }
        EncodingCandidate::for_label(value)
            .map(EncodingChoice::Fixed)
            .ok_or_else(|| IngestError::Configuration(format!("unknown encoding '{value}'")))
    }
}

/// Places `primary` first and keeps the remaining candidates in their original order.
pub fn fallback_order(
    primary: EncodingCandidate,
    candidates: &[EncodingCandidate],
) -> Vec<EncodingCandidate> {
    let mut ordered = Vec::with_capacity(candidates.len() + 1);
    ordered.push(primary);
    ordered.extend(candidates.iter().copied().filter(|c| *c != primary));
    ordered
}

/// Runs `attempt` for each candidate in order and returns the first success.
///
/// On exhaustion every failure is returned, in order, so the caller can report
/// what was tried.
pub fn first_success<T, E, F>(
    candidates: &[EncodingCandidate],
    mut attempt: F,
) -> std::result::Result<(T, EncodingCandidate), Vec<EncodingAttempt>>
where
    F: FnMut(EncodingCandidate) -> std::result::Result<T, E>,
    E: fmt::Display,
{
    let mut failures = Vec::new();
    for candidate in candidates {
        match attempt(*candidate) {
            Ok(value) => return Ok((value, *candidate)),
            Err(err) => {
                debug!("Encoding {candidate} rejected: {err}");
                failures.push(EncodingAttempt {
                    encoding: candidate.label.to_string(),
                    message: err.to_string(),
                });
            }
        }
    }
    Err(failures)
}

/// Picks the encoding for `path` from `candidates`.
///
/// Small files are decoded whole, large files through a [`PROBE_BYTES`] prefix.
/// A leading UTF-8 byte-order mark selects the BOM candidate directly when the
/// list contains one.
pub fn detect_encoding(path: &Path, candidates: &[EncodingCandidate]) -> Result<EncodingCandidate> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut prefix = Vec::with_capacity(PROBE_BYTES.min(file_len as usize));
    BufReader::new(file)
        .take(PROBE_BYTES as u64)
        .read_to_end(&mut prefix)?;
    let complete = file_len <= PROBE_BYTES as u64;

    let detected = detect_bytes(&prefix, complete, candidates).map_err(|attempts| {
        IngestError::EncodingExhausted {
            path: path.to_path_buf(),
            attempts,
        }
    })?;
    info!(
        "Detected encoding {} for {:?} ({} byte probe{})",
        detected,
        path,
        prefix.len(),
        if complete { ", whole file" } else { "" }
    );
    Ok(detected)
}

/// Byte-level detection behind [`detect_encoding`].
pub fn detect_bytes(
    bytes: &[u8],
    complete: bool,
    candidates: &[EncodingCandidate],
) -> std::result::Result<EncodingCandidate, Vec<EncodingAttempt>> {
    if bytes.starts_with(UTF8_BOM)
        && let Some(bom) = candidates.iter().find(|c| c.bom)
        && bom.probe(bytes, complete)
    {
        return Ok(*bom);
    }
    first_success(candidates, |candidate| {
        if candidate.probe(bytes, complete) {
            Ok(())
        } else {
            Err(format!("probe did not decode under {candidate}"))
        }
    })
    .map(|((), candidate)| candidate)
}
