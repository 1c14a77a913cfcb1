//! Module with datastructures stored in RocksDB.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};

use crate::err::IngestError;

/// Tag bytes of the cell variants, also used as kind byte in index keys.
const TAG_MISSING: u8 = 0;
const TAG_NUMBER: u8 = 1;
const TAG_TEXT: u8 = 2;

/// One value of the persisted table.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    /// The "no value" marker, distinct from empty text and from numbers.
    Missing,
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Missing)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(value) => Some(*value),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Cell::Missing => TAG_MISSING,
            Cell::Number(_) => TAG_NUMBER,
            Cell::Text(_) => TAG_TEXT,
        }
    }
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cell::Missing => write!(f, "."),
            Cell::Number(value) => write!(f, "{}", crate::common::format_number(*value)),
            Cell::Text(value) => write!(f, "{}", value),
        }
    }
}

fn corrupt(what: &str, e: std::io::Error) -> IngestError {
    IngestError::Store(format!("corrupt {}: {}", what, e))
}

/// Convert a row to a byte vector.
pub fn row_to_vec(row: &[Cell]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 9 * row.len());
    buf.extend_from_slice(&(row.len() as u32).to_le_bytes());
    for cell in row {
        buf.push(cell.tag());
        match cell {
            Cell::Missing => (),
            Cell::Number(value) => buf.extend_from_slice(&value.to_le_bytes()),
            Cell::Text(value) => {
                buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
                buf.extend_from_slice(value.as_bytes());
            }
        }
    }
    buf
}

/// Convert from a byte vector.
pub fn row_from_vec(buf: &[u8]) -> Result<Vec<Cell>, IngestError> {
    let mut cursor = Cursor::new(buf);
    let len = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| corrupt("row", e))?;
    let mut row = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let cell = match cursor.read_u8().map_err(|e| corrupt("row", e))? {
            TAG_MISSING => Cell::Missing,
            TAG_NUMBER => Cell::Number(
                cursor
                    .read_f64::<LittleEndian>()
                    .map_err(|e| corrupt("row", e))?,
            ),
            TAG_TEXT => {
                let n = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|e| corrupt("row", e))?;
                let mut bytes = vec![0u8; n as usize];
                cursor
                    .read_exact(&mut bytes)
                    .map_err(|e| corrupt("row", e))?;
                Cell::Text(
                    String::from_utf8(bytes)
                        .map_err(|e| IngestError::Store(format!("corrupt row: {}", e)))?,
                )
            }
            tag => return Err(IngestError::Store(format!("corrupt row: cell tag {}", tag))),
        };
        row.push(cell);
    }
    if (cursor.position() as usize) != buf.len() {
        return Err(IngestError::Store(format!(
            "corrupt row: {} trailing bytes",
            buf.len() - cursor.position() as usize
        )));
    }
    Ok(row)
}

/// Key of a row in the `df` column family.
pub fn row_key(row_id: u64) -> [u8; 8] {
    row_id.to_be_bytes()
}

/// Row id from a key of the `df` column family.
pub fn row_id_from_key(key: &[u8]) -> Result<u64, IngestError> {
    if key.len() != 8 {
        return Err(IngestError::Store(format!(
            "corrupt row key of length {}",
            key.len()
        )));
    }
    Ok(BigEndian::read_u64(key))
}

/// Map a float to bytes whose lexicographic order is the numeric order.
fn sortable_f64(value: f64) -> [u8; 8] {
    // fold -0.0 into 0.0 so that both have the same key
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    let bits = if bits >> 63 == 1 {
        !bits
    } else {
        bits ^ (1 << 63)
    };
    bits.to_be_bytes()
}

/// Prefix of all index keys of `column` with value `cell`.
///
/// Layout: column `u32` BE, kind byte, value, and for text a trailing zero
/// byte.  The full key appends the row id as `u64` BE.  Text is indexed
/// folded to upper case, so lookups are case-insensitive.
pub fn index_prefix(column: u32, cell: &Cell) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&column.to_be_bytes());
    buf.push(cell.tag());
    match cell {
        Cell::Missing => (),
        Cell::Number(value) => buf.extend_from_slice(&sortable_f64(*value)),
        Cell::Text(value) => {
            buf.extend_from_slice(value.to_ascii_uppercase().as_bytes());
            buf.push(0);
        }
    }
    buf
}

/// Full index key of `row_id` in `column` with value `cell`.
pub fn index_key(column: u32, cell: &Cell, row_id: u64) -> Vec<u8> {
    let mut buf = index_prefix(column, cell);
    buf.extend_from_slice(&row_id.to_be_bytes());
    buf
}

/// Row id from the trailing bytes of an index key.
pub fn row_id_from_index_key(key: &[u8]) -> Result<u64, IngestError> {
    if key.len() < 13 {
        return Err(IngestError::Store(format!(
            "corrupt index key of length {}",
            key.len()
        )));
    }
    row_id_from_key(&key[key.len() - 8..])
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn row_codec() -> Result<(), anyhow::Error> {
        let row = vec![
            Cell::Text(String::from("01")),
            Cell::Number(12345.0),
            Cell::Missing,
            Cell::Text(String::new()),
            Cell::Number(-0.5),
        ];

        let buf = row_to_vec(&row);
        assert_eq!(buf.len(), 4 + (1 + 4 + 2) + (1 + 8) + 1 + (1 + 4) + (1 + 8));
        assert_eq!(row_from_vec(&buf)?, row);

        Ok(())
    }

    #[test]
    fn truncated_row_is_error() {
        let buf = row_to_vec(&[Cell::Text(String::from("hello"))]);

        assert!(matches!(
            row_from_vec(&buf[..buf.len() - 1]),
            Err(IngestError::Store(_))
        ));
    }

    #[test]
    fn wide_row_keeps_every_cell() -> Result<(), anyhow::Error> {
        let row = (0..70_000)
            .map(|i| {
                if i % 2 == 0 {
                    Cell::Number(i as f64)
                } else {
                    Cell::Missing
                }
            })
            .collect::<Vec<_>>();

        let decoded = row_from_vec(&row_to_vec(&row))?;

        assert_eq!(decoded.len(), 70_000);
        assert_eq!(decoded[69_998], Cell::Number(69_998.0));
        assert_eq!(decoded, row);

        Ok(())
    }

    #[test]
    fn trailing_bytes_are_error() {
        let mut buf = row_to_vec(&[Cell::Missing]);
        buf.push(TAG_MISSING);

        assert!(matches!(row_from_vec(&buf), Err(IngestError::Store(_))));
    }

    #[test]
    fn wide_column_ids_do_not_collide() {
        let low = index_key(4_464, &Cell::Number(1.0), 0);
        let high = index_key(70_000, &Cell::Number(1.0), 0);

        assert_ne!(low, high);
        assert!(!high.starts_with(&index_prefix(4_464, &Cell::Number(1.0))));
    }

    #[test]
    fn numeric_keys_sort_numerically() {
        let values = [-1000.5, -2.0, -0.0, 0.0, 0.25, 3.0, 10.0, 1e9];
        let keys = values
            .iter()
            .map(|v| index_key(5, &Cell::Number(*v), 0))
            .collect::<Vec<_>>();

        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys[2], keys[3]);
    }

    #[test]
    fn text_prefix_does_not_match_longer_values() {
        let prefix = index_prefix(0, &Cell::Text(String::from("01")));
        let other = index_key(0, &Cell::Text(String::from("010")), 7);
        let own = index_key(0, &Cell::Text(String::from("01")), 7);

        assert!(!other.starts_with(&prefix));
        assert!(own.starts_with(&prefix));
        assert!(index_key(0, &Cell::Text(String::from("rs1")), 1)
            .starts_with(&index_prefix(0, &Cell::Text(String::from("RS1")))));
        assert_eq!(row_id_from_index_key(&own).ok(), Some(7));
    }
}
