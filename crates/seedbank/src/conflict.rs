//! Recovery of cases mangled by an unresolved VCS merge.
//!
//! An automated corpus merge occasionally leaves a stored file with literal
//! conflict markers in it. The payloads on either side of the markers are
//! still valid fuzz cases; splitting them back out recovers otherwise-lost
//! coverage.

use lazy_static::lazy_static;
use regex::bytes::Regex;

lazy_static! {
    // A whole line starting with the opening, separator, or closing marker,
    // including its trailing newline.
    static ref CONFLICT: Regex =
        Regex::new(r"(?m)^(?:<{7,8}|>{7,8}|={7,8})[^\n]*\n?").expect("static conflict pattern");
}

/// Whether `data` contains an unresolved merge-conflict marker line.
pub fn has_conflict(data: &[u8]) -> bool {
    CONFLICT.is_match(data)
}

/// The byte ranges outside the marker lines, markers and empty ranges
/// discarded. Each returned section is an independent case in its own right.
pub fn split_sections(data: &[u8]) -> Vec<&[u8]> {
    CONFLICT
        .split(data)
        .filter(|section| !section.is_empty())
        .collect()
}
