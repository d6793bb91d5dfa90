//! Journal format parser using nom
//!
//! File format:
//! ```text
//! pixstore.journal
//! [journal version]
//! [app version]
//!
//! DIRTY <key>
//! CLEAN <key> <len>
//! READ <key>
//! REMOVE <key>
//! ```
//!
//! Every mutation of the store is appended as one record. Replaying the
//! records in order rebuilds the entry table and its LRU order.

use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while_m_n},
    character::complete::{char, digit1},
    combinator::{all_consuming, map, map_res},
    sequence::{preceded, separated_pair, terminated},
    IResult,
};

use crate::error::{Error, Result};

/// Magic first line of every journal
pub const JOURNAL_MAGIC: &[u8] = b"pixstore.journal\n";

/// Journal format version written by this crate
pub const JOURNAL_VERSION: u32 = 1;

/// Longest accepted entry key
pub const MAX_KEY_LEN: usize = 64;

/// Parsed journal header
#[derive(Debug, Clone, PartialEq)]
pub struct JournalHeader {
    /// Journal format version
    pub version: u32,
    /// Application version the entries were written by
    pub app_version: u32,
}

/// One journal record
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// An edit of the entry started
    Dirty(String),
    /// An edit was committed; the blob is `len` bytes
    Clean(String, u64),
    /// The entry was read
    Read(String),
    /// The entry was removed
    Remove(String),
}

impl Record {
    /// Key the record refers to
    pub fn key(&self) -> &str {
        match self {
            Record::Dirty(k) | Record::Clean(k, _) | Record::Read(k) | Record::Remove(k) => k,
        }
    }

    /// Serialize the record as a newline-terminated journal line
    pub fn to_line(&self) -> String {
        match self {
            Record::Dirty(k) => format!("DIRTY {}\n", k),
            Record::Clean(k, len) => format!("CLEAN {} {}\n", k, len),
            Record::Read(k) => format!("READ {}\n", k),
            Record::Remove(k) => format!("REMOVE {}\n", k),
        }
    }
}

/// Returns true if `key` is usable as an entry name on disk
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LEN && key.bytes().all(is_key_byte)
}

fn is_key_byte(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-'
}

fn decimal<T: FromStr>(input: &[u8]) -> IResult<&[u8], T> {
    map_res(map_res(digit1, std::str::from_utf8), str::parse::<T>)(input)
}

fn key(input: &[u8]) -> IResult<&[u8], &str> {
    map_res(take_while_m_n(1, MAX_KEY_LEN, is_key_byte), std::str::from_utf8)(input)
}

fn header(input: &[u8]) -> IResult<&[u8], JournalHeader> {
    let (input, _) = tag(JOURNAL_MAGIC)(input)?;
    let (input, version) = terminated(decimal::<u32>, char('\n'))(input)?;
    let (input, app_version) = terminated(decimal::<u32>, char('\n'))(input)?;
    let (input, _) = char('\n')(input)?;
    Ok((input, JournalHeader { version, app_version }))
}

fn record(input: &[u8]) -> IResult<&[u8], Record> {
    alt((
        map(
            separated_pair(preceded(tag("CLEAN "), key), char(' '), decimal::<u64>),
            |(k, len)| Record::Clean(k.to_string(), len),
        ),
        map(preceded(tag("DIRTY "), key), |k| Record::Dirty(k.to_string())),
        map(preceded(tag("READ "), key), |k| Record::Read(k.to_string())),
        map(preceded(tag("REMOVE "), key), |k| Record::Remove(k.to_string())),
    ))(input)
}

/// Parse a single raw line, returning its content without the trailing newline
pub fn parse_line(input: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(take_until("\n"), char('\n'))(input)
}

/// Parse the journal header
///
/// # Returns
/// * The header and the remaining (record) bytes
pub fn parse_header(input: &[u8]) -> Result<(JournalHeader, &[u8])> {
    let (rest, header) = header(input)?;
    if header.version != JOURNAL_VERSION {
        return Err(Error::Parse(format!(
            "Unsupported journal version {}",
            header.version
        )));
    }
    Ok((header, rest))
}

/// Parse one record line (without its trailing newline)
pub fn parse_record(line: &[u8]) -> Result<Record> {
    let (_, record) = all_consuming(record)(line)?;
    Ok(record)
}

/// Parse every complete record following the header
///
/// A final line without a newline is a torn append and is skipped;
/// the returned flag reports whether that happened.
pub fn parse_records(mut input: &[u8]) -> Result<(Vec<Record>, bool)> {
    let mut records = Vec::new();
    while !input.is_empty() {
        match parse_line(input) {
            Ok((rest, line)) => {
                records.push(parse_record(line)?);
                input = rest;
            }
            Err(_) => return Ok((records, true)),
        }
    }
    Ok((records, false))
}

/// Create a journal header
pub fn create_header(app_version: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(JOURNAL_MAGIC.len() + 16);
    out.extend_from_slice(JOURNAL_MAGIC);
    out.extend_from_slice(format!("{}\n{}\n\n", JOURNAL_VERSION, app_version).as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        let bytes = create_header(7);
        let (parsed, rest) = parse_header(&bytes).unwrap();

        assert_eq!(parsed.version, JOURNAL_VERSION);
        assert_eq!(parsed.app_version, 7);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_parse_header_invalid_magic() {
        let mut bytes = create_header(1);
        bytes[0] = b'X';

        assert!(parse_header(&bytes).is_err());
    }

    #[test]
    fn test_parse_header_unknown_version() {
        let bytes = b"pixstore.journal\n9\n1\n\n";
        assert!(matches!(parse_header(bytes), Err(Error::Parse(_))));
    }

    #[test]
    fn test_parse_records() {
        let input = b"DIRTY abc\nCLEAN abc 120\nREAD abc\nREMOVE abc\n";
        let (records, torn) = parse_records(input).unwrap();

        assert!(!torn);
        assert_eq!(
            records,
            vec![
                Record::Dirty("abc".into()),
                Record::Clean("abc".into(), 120),
                Record::Read("abc".into()),
                Record::Remove("abc".into()),
            ]
        );
    }

    #[test]
    fn test_parse_records_torn_tail() {
        let input = b"DIRTY abc\nCLEAN abc 12";
        let (records, torn) = parse_records(input).unwrap();

        assert!(torn);
        assert_eq!(records, vec![Record::Dirty("abc".into())]);
    }

    #[test]
    fn test_parse_record_rejects_garbage() {
        assert!(parse_record(b"CLEAN abc").is_err());
        assert!(parse_record(b"WRITE abc").is_err());
        assert!(parse_record(b"READ ABC").is_err());
        assert!(parse_record(b"READ abc trailing").is_err());
    }

    #[test]
    fn test_record_line_format() {
        let record = Record::Clean("k-1".into(), 42);
        assert_eq!(record.to_line(), "CLEAN k-1 42\n");
        assert_eq!(parse_record(record.to_line().trim_end().as_bytes()).unwrap(), record);
    }

    #[test]
    fn test_valid_keys() {
        assert!(is_valid_key("0a1b_c-d"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("Upper"));
        assert!(!is_valid_key("has space"));
        assert!(!is_valid_key(&"a".repeat(MAX_KEY_LEN + 1)));
    }
}
