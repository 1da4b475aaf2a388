use std::fmt;

use serde::Serialize;

use crate::error::{CrossdisError, Result};

/// One row of a 3.11+ exception table. Offsets are in bytes, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExceptionEntry {
    pub start: usize,
    pub end: usize,
    pub target: usize,
    pub depth: u64,
    pub lasti: bool,
}

impl fmt::Display for ExceptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {} -> {} [{}]", self.start, self.end, self.target, self.depth)?;
        if self.lasti {
            f.write_str(" lasti")?;
        }
        Ok(())
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl Reader<'_> {
    /// Big-endian 6-bit groups, bit 6 continues. Bit 7 of the first byte
    /// flags the start of an entry and must match `entry_start`.
    fn varint(&mut self, entry_start: bool) -> Result<u64> {
        let at = self.position;
        let mut b = *self.bytes.get(at).ok_or(CrossdisError::ExceptionTable { position: at })?;
        if (b & 0x80 != 0) != entry_start {
            return Err(CrossdisError::ExceptionTable { position: at });
        }
        self.position += 1;
        let mut value = u64::from(b & 0x3F);
        while b & 0x40 != 0 {
            let at = self.position;
            b = *self.bytes.get(at).ok_or(CrossdisError::ExceptionTable { position: at })?;
            self.position += 1;
            value = value
                .checked_mul(64)
                .map(|v| v | u64::from(b & 0x3F))
                .ok_or(CrossdisError::ExceptionTable { position: at })?;
        }
        Ok(value)
    }

    fn offset(&mut self, entry_start: bool) -> Result<usize> {
        let at = self.position;
        let units = self.varint(entry_start)?;
        units
            .checked_mul(2)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or(CrossdisError::ExceptionTable { position: at })
    }
}

pub fn parse(table: &[u8]) -> Result<Vec<ExceptionEntry>> {
    let mut reader = Reader { bytes: table, position: 0 };
    let mut entries = Vec::new();
    while reader.position < table.len() {
        let at = reader.position;
        let start = reader.offset(true)?;
        let length = reader.offset(false)?;
        let target = reader.offset(false)?;
        let depth_lasti = reader.varint(false)?;
        let end = start.checked_add(length).ok_or(CrossdisError::ExceptionTable { position: at })?;
        entries.push(ExceptionEntry { start, end, target, depth: depth_lasti >> 1, lasti: depth_lasti & 1 != 0 });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries() {
        // start 2 units, length 4 units, target 10 units, depth 1 lasti
        // then start 70 units (two-byte varint), length 1, target 3, depth 0
        let table = [0x82, 0x04, 0x0A, 0x03, 0xC1, 0x06, 0x01, 0x03, 0x00];
        let entries = parse(&table).unwrap();
        assert_eq!(
            entries,
            vec![
                ExceptionEntry { start: 4, end: 12, target: 20, depth: 1, lasti: true },
                ExceptionEntry { start: 140, end: 142, target: 6, depth: 0, lasti: false },
            ]
        );
        assert_eq!(entries[0].to_string(), "4 to 12 -> 20 [1] lasti");
    }

    #[test]
    fn rejects_missing_entry_marker_and_truncation() {
        assert!(parse(&[0x02, 0x04, 0x0A, 0x03]).is_err());
        assert!(parse(&[0x82, 0x04, 0x0A]).is_err());
        assert!(parse(&[0x82, 0x84, 0x0A, 0x03]).is_err());
    }
}
