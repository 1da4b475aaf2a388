//! Offset to source-line maps.
//!
//! Three encodings are supported: the classic `lnotab` byte pairs, the 3.10
//! `linetable` delta pairs and the 3.11 location table. The latter two decode
//! into address ranges; [`linestarts_from_ranges`] turns ranges into starts.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::code::CodeObject;
use crate::error::{CrossdisError, Result};
use crate::table::LineTableFormat;

/// Half-open byte range `[start, end)` attributed to `line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
    pub line: Option<u32>,
}

impl LineRange {
    pub fn new(start: usize, end: usize, line: Option<u32>) -> Self {
        Self { start, end, line }
    }
}

fn add_delta(line: i64, delta: i64, position: usize) -> Result<i64> {
    line.checked_add(delta).ok_or(CrossdisError::LineTable { position })
}

fn to_line(line: i64, position: usize) -> Result<u32> {
    u32::try_from(line).map_err(|_| CrossdisError::LineTable { position })
}

/// Classic `lnotab`. Line deltas are unsigned before 3.6 and signed after.
pub fn lnotab_starts(
    lnotab: &[u8],
    firstlineno: u32,
    signed: bool,
    dup_lines: bool,
) -> Result<Vec<(usize, u32)>> {
    if lnotab.len() % 2 != 0 {
        return Err(CrossdisError::LineTable { position: lnotab.len() - 1 });
    }
    let mut starts = Vec::new();
    let mut last_line = None;
    let mut line = i64::from(firstlineno);
    let mut addr = 0usize;
    for (index, pair) in lnotab.chunks_exact(2).enumerate() {
        let (byte_delta, raw_line_delta) = (pair[0], pair[1]);
        if byte_delta != 0 {
            if dup_lines || last_line != Some(line) {
                starts.push((addr, to_line(line, index * 2)?));
                last_line = Some(line);
            }
            addr += usize::from(byte_delta);
        }
        let line_delta = if signed {
            i64::from(raw_line_delta as i8)
        } else {
            i64::from(raw_line_delta)
        };
        line = add_delta(line, line_delta, index * 2 + 1)?;
    }
    if dup_lines || last_line != Some(line) {
        starts.push((addr, to_line(line, lnotab.len())?));
    }
    Ok(starts)
}

/// 3.10 `linetable`: `(byte_delta, line_delta)` pairs where a line delta of
/// -128 means "no line" and zero-width entries are dropped.
pub fn linetable_ranges(table: &[u8], firstlineno: u32) -> Result<Vec<LineRange>> {
    if table.len() % 2 != 0 {
        return Err(CrossdisError::LineTable { position: table.len() - 1 });
    }
    let mut ranges = Vec::new();
    let mut line = i64::from(firstlineno);
    let mut end = 0usize;
    for (index, pair) in table.chunks_exact(2).enumerate() {
        let byte_delta = usize::from(pair[0]);
        let line_delta = pair[1] as i8;
        if line_delta == 0 {
            end += byte_delta;
            continue;
        }
        let start = end;
        end = start + byte_delta;
        if line_delta == -128 {
            continue;
        }
        line = add_delta(line, i64::from(line_delta), index * 2 + 1)?;
        if start == end {
            continue;
        }
        ranges.push(LineRange::new(start, end, Some(to_line(line, index * 2 + 1)?)));
    }
    Ok(ranges)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl Cursor<'_> {
    fn byte(&mut self) -> Result<u8> {
        let b = *self.bytes.get(self.position).ok_or(CrossdisError::LineTable { position: self.position })?;
        self.position += 1;
        Ok(b)
    }

    fn varint(&mut self) -> Result<u64> {
        let mut b = self.byte()?;
        let mut value = u64::from(b & 0x3F);
        let mut shift = 6;
        while b & 0x40 != 0 {
            b = self.byte()?;
            if shift > 57 {
                return Err(CrossdisError::LineTable { position: self.position - 1 });
            }
            value |= u64::from(b & 0x3F) << shift;
            shift += 6;
        }
        Ok(value)
    }

    fn svarint(&mut self) -> Result<i64> {
        let raw = self.varint()?;
        let magnitude = i64::try_from(raw >> 1).map_err(|_| CrossdisError::LineTable { position: self.position })?;
        Ok(if raw & 1 != 0 { -magnitude } else { magnitude })
    }
}

/// 3.11+ location table. Column data is read and discarded.
pub fn location_ranges(table: &[u8], firstlineno: u32) -> Result<Vec<LineRange>> {
    let mut cursor = Cursor { bytes: table, position: 0 };
    let mut ranges: Vec<LineRange> = Vec::new();
    let mut line = i64::from(firstlineno);
    let mut addr = 0usize;
    while cursor.position < table.len() {
        let header_at = cursor.position;
        let header = cursor.byte()?;
        if header & 0x80 == 0 {
            return Err(CrossdisError::LineTable { position: header_at });
        }
        let code = (header >> 3) & 0x0F;
        let length = usize::from(header & 0x07) + 1;
        let entry_line = match code {
            15 => None,
            14 => {
                line = add_delta(line, cursor.svarint()?, header_at)?;
                cursor.varint()?;
                cursor.varint()?;
                cursor.varint()?;
                Some(line)
            }
            13 => {
                line = add_delta(line, cursor.svarint()?, header_at)?;
                Some(line)
            }
            10..=12 => {
                line = add_delta(line, i64::from(code - 10), header_at)?;
                cursor.byte()?;
                cursor.byte()?;
                Some(line)
            }
            _ => {
                cursor.byte()?;
                Some(line)
            }
        };
        let entry_line = entry_line.map(|l| to_line(l, header_at)).transpose()?;
        let end = addr + length * 2;
        match ranges.last_mut() {
            Some(last) if last.line == entry_line && last.end == addr => last.end = end,
            _ => ranges.push(LineRange::new(addr, end, entry_line)),
        }
        addr = end;
    }
    Ok(ranges)
}

/// Yields a start wherever the line changes; ranges without a line are
/// skipped. With `dup_lines` every range with a line yields a start.
pub fn linestarts_from_ranges(ranges: &[LineRange], dup_lines: bool) -> Vec<(usize, u32)> {
    let mut last_line = None;
    let mut starts = Vec::new();
    for range in ranges {
        let Some(line) = range.line else { continue };
        if dup_lines || last_line != Some(line) {
            starts.push((range.start, line));
            last_line = Some(line);
        }
    }
    starts
}

/// Line starts for `code` under the given encoding.
pub fn linestarts(code: &CodeObject, format: LineTableFormat, dup_lines: bool) -> Result<BTreeMap<usize, u32>> {
    let table = &code.linetable;
    let starts = match format {
        LineTableFormat::Lnotab => lnotab_starts(table, code.firstlineno, false, dup_lines)?,
        LineTableFormat::LnotabSigned => lnotab_starts(table, code.firstlineno, true, dup_lines)?,
        LineTableFormat::Linetable => {
            linestarts_from_ranges(&linetable_ranges(table, code.firstlineno)?, dup_lines)
        }
        LineTableFormat::Locations => {
            linestarts_from_ranges(&location_ranges(table, code.firstlineno)?, dup_lines)
        }
    };
    // The first start wins when dup_lines yields one offset twice.
    let mut map = BTreeMap::new();
    for (offset, line) in starts {
        map.entry(offset).or_insert(line);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DELTAS: [u8; 16] = [6, 1, 44, 1, 254, 5, 46, 0, 10, 0x80, 16, 1, 0, 127, 4, 73];

    #[test]
    fn linetable_skips_no_line_and_zero_width_entries() {
        let ranges = linetable_ranges(&DELTAS, 1).unwrap();
        assert_eq!(
            ranges,
            vec![
                LineRange::new(0, 6, Some(2)),
                LineRange::new(6, 50, Some(3)),
                LineRange::new(50, 304, Some(8)),
                LineRange::new(360, 376, Some(9)),
                LineRange::new(376, 380, Some(209)),
            ]
        );
        assert_eq!(
            linestarts_from_ranges(&ranges, false),
            vec![(0, 2), (6, 3), (50, 8), (360, 9), (376, 209)]
        );
    }

    #[test]
    fn lnotab_signed_and_unsigned() {
        // +2 bytes/+1 line, +4 bytes/-1 line
        let table = [2, 1, 4, 0xFF];
        assert_eq!(lnotab_starts(&table, 10, true, false).unwrap(), vec![(0, 10), (2, 11), (6, 10)]);
        assert_eq!(
            lnotab_starts(&table, 10, false, false).unwrap(),
            vec![(0, 10), (2, 11), (6, 266)]
        );
        assert!(lnotab_starts(&[1], 1, true, false).is_err());
    }

    #[test]
    fn lnotab_dup_lines() {
        let table = [2, 0, 2, 1];
        assert_eq!(lnotab_starts(&table, 1, true, false).unwrap(), vec![(0, 1), (4, 2)]);
        assert_eq!(lnotab_starts(&table, 1, true, true).unwrap(), vec![(0, 1), (2, 1), (4, 2)]);
    }

    #[test]
    fn location_table_forms() {
        let table = [
            0xF0, 0x00, 0x00, 0x01, 0x05, // long form, line +0 -> 1, 1 unit
            0xE8, 0x02, // no-column form, line +1 -> 2, 1 unit
            0x80, 0x05, // short form, same line, 1 unit
            0xF9, // no location, 2 units
            0xE8, 0x02, // line 3 via no-column form, 1 unit
        ];
        let ranges = location_ranges(&table, 1).unwrap();
        assert_eq!(
            ranges,
            vec![
                LineRange::new(0, 2, Some(1)),
                LineRange::new(2, 6, Some(2)),
                LineRange::new(6, 10, None),
                LineRange::new(10, 12, Some(3)),
            ]
        );
        assert_eq!(linestarts_from_ranges(&ranges, false), vec![(0, 1), (2, 2), (10, 3)]);
        assert!(location_ranges(&[0x10], 1).is_err());
        assert!(location_ranges(&[0xD8], 1).is_err());
    }
}
