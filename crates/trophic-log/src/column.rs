//! Type-homogeneous column encoding.
//!
//! A column is the values of one field across every entity of one kind in one
//! timestep (or the whole grid). Values are laid out contiguously in
//! little-endian order and the buffer is compressed with zstd. Homogeneous
//! columns compress far better than row-wise records, which is the point of
//! storing them this way.

use serde::{Deserialize, Serialize};
use trophic_store::value::{Value, ValueType};

use crate::LogError;

/// Physical type of a stored column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Entity ids.
    U64,
    /// Entity coordinates.
    I32,
    /// Grid cells.
    F32,
    Int,
    Float,
    Bool,
    Text,
}

impl From<ValueType> for ColumnType {
    fn from(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Int => ColumnType::Int,
            ValueType::Float => ColumnType::Float,
            ValueType::Bool => ColumnType::Bool,
            ValueType::Text => ColumnType::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// A decoded column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    U64(Vec<u64>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    Bool(Vec<bool>),
    Text(Vec<String>),
}

impl Column {
    /// An empty column of the given type.
    pub fn empty(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::U64 => Column::U64(Vec::new()),
            ColumnType::I32 => Column::I32(Vec::new()),
            ColumnType::F32 => Column::F32(Vec::new()),
            ColumnType::Int => Column::Int(Vec::new()),
            ColumnType::Float => Column::Float(Vec::new()),
            ColumnType::Bool => Column::Bool(Vec::new()),
            ColumnType::Text => Column::Text(Vec::new()),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Column::U64(_) => ColumnType::U64,
            Column::I32(_) => ColumnType::I32,
            Column::F32(_) => ColumnType::F32,
            Column::Int(_) => ColumnType::Int,
            Column::Float(_) => ColumnType::Float,
            Column::Bool(_) => ColumnType::Bool,
            Column::Text(_) => ColumnType::Text,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::U64(v) => v.len(),
            Column::I32(v) => v.len(),
            Column::F32(v) => v.len(),
            Column::Int(v) => v.len(),
            Column::Float(v) => v.len(),
            Column::Bool(v) => v.len(),
            Column::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a field value. Returns `false` (and appends nothing) if the
    /// value's type does not match the column.
    pub fn push_value(&mut self, value: &Value) -> bool {
        match (self, value) {
            (Column::Int(v), Value::Int(x)) => v.push(*x),
            (Column::Float(v), Value::Float(x)) => v.push(*x),
            (Column::Bool(v), Value::Bool(x)) => v.push(*x),
            (Column::Text(v), Value::Text(x)) => v.push(x.clone()),
            _ => return false,
        }
        true
    }

    /// The field value at `row`, for field-typed columns.
    pub fn value_at(&self, row: usize) -> Option<Value> {
        match self {
            Column::Int(v) => v.get(row).map(|x| Value::Int(*x)),
            Column::Float(v) => v.get(row).map(|x| Value::Float(*x)),
            Column::Bool(v) => v.get(row).map(|x| Value::Bool(*x)),
            Column::Text(v) => v.get(row).map(|x| Value::Text(x.clone())),
            Column::U64(_) | Column::I32(_) | Column::F32(_) => None,
        }
    }

    /// Raw little-endian encoding. Text values are length-prefixed (`u32`).
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Column::U64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Column::I32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Column::F32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Column::Int(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Column::Float(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Column::Bool(v) => out.extend(v.iter().map(|&b| u8::from(b))),
            Column::Text(v) => {
                for s in v {
                    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
            }
        }
    }

    /// Decode `rows` values of `column_type` from `reader`.
    pub(crate) fn decode(
        column_type: ColumnType,
        reader: &mut ByteReader<'_>,
        rows: usize,
    ) -> Option<Column> {
        let column = match column_type {
            ColumnType::U64 => Column::U64(repeat(rows, || reader.u64())?),
            ColumnType::I32 => Column::I32(repeat(rows, || reader.i32())?),
            ColumnType::F32 => Column::F32(repeat(rows, || reader.f32())?),
            ColumnType::Int => Column::Int(repeat(rows, || reader.i64())?),
            ColumnType::Float => Column::Float(repeat(rows, || reader.f64())?),
            ColumnType::Bool => Column::Bool(repeat(rows, || reader.u8().map(|b| b != 0))?),
            ColumnType::Text => Column::Text(repeat(rows, || {
                let len = reader.u32()? as usize;
                let bytes = reader.take(len)?;
                String::from_utf8(bytes.to_vec()).ok()
            })?),
        };
        Some(column)
    }
}

fn repeat<T>(rows: usize, mut next: impl FnMut() -> Option<T>) -> Option<Vec<T>> {
    let mut out = Vec::with_capacity(rows);
    for _ in 0..rows {
        out.push(next()?);
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Field columns
// ---------------------------------------------------------------------------

/// A field column whose rows may be absent.
///
/// Records written before a field was declared do not carry it. `present` is
/// empty when every row has a value; otherwise it holds one flag per row and
/// `values` holds only the present rows.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldColumn {
    pub present: Vec<bool>,
    pub values: Column,
}

impl FieldColumn {
    pub fn new(value_type: ValueType) -> Self {
        Self {
            present: Vec::new(),
            values: Column::empty(value_type.into()),
        }
    }

    /// Append the next row. `None` marks the row absent.
    ///
    /// Returns `false` on a type mismatch.
    pub fn push(&mut self, row: usize, value: Option<&Value>) -> bool {
        match value {
            Some(value) => {
                if !self.values.push_value(value) {
                    return false;
                }
                if !self.present.is_empty() {
                    self.present.push(true);
                }
            }
            None => {
                if self.present.is_empty() {
                    // Every earlier row was present.
                    self.present.resize(row, true);
                }
                self.present.push(false);
            }
        }
        true
    }

    /// Number of rows carrying a value.
    pub fn present_count(&self) -> usize {
        self.values.len()
    }

    /// Value of each row, `None` where absent.
    pub fn rows(&self, rows: usize) -> Vec<Option<Value>> {
        if self.present.is_empty() {
            return (0..rows).map(|r| self.values.value_at(r)).collect();
        }
        let mut next = 0;
        self.present
            .iter()
            .map(|&here| {
                here.then(|| {
                    let v = self.values.value_at(next);
                    next += 1;
                    v
                })
                .flatten()
            })
            .collect()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend(self.present.iter().map(|&b| u8::from(b)));
        self.values.encode_into(out);
    }

    pub(crate) fn decode(
        value_type: ValueType,
        reader: &mut ByteReader<'_>,
        rows: usize,
        present_count: usize,
    ) -> Option<FieldColumn> {
        let present = if present_count < rows {
            let flags: Vec<bool> = reader.take(rows)?.iter().map(|&b| b != 0).collect();
            if flags.iter().filter(|&&b| b).count() != present_count {
                return None;
            }
            flags
        } else {
            Vec::new()
        };
        let values = Column::decode(value_type.into(), reader, present_count)?;
        Some(FieldColumn { present, values })
    }
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

/// zstd-compress an encoded column.
pub fn compress(raw: &[u8], level: i32) -> Result<Vec<u8>, LogError> {
    Ok(zstd::bulk::compress(raw, level)?)
}

/// Inverse of [`compress`]. `offset` locates the blob for error reports.
pub fn decompress(blob: &[u8], offset: u64) -> Result<Vec<u8>, LogError> {
    zstd::stream::decode_all(blob).map_err(|e| LogError::Corrupt {
        offset,
        reason: format!("column decompression failed: {e}"),
    })
}

// ---------------------------------------------------------------------------
// ByteReader
// ---------------------------------------------------------------------------

/// Little-endian cursor over a byte slice.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.pos == self.bytes.len()
    }

    pub(crate) fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    pub(crate) fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|b| b[0])
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub(crate) fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_le_bytes)
    }

    pub(crate) fn i32(&mut self) -> Option<i32> {
        self.array().map(i32::from_le_bytes)
    }

    pub(crate) fn i64(&mut self) -> Option<i64> {
        self.array().map(i64::from_le_bytes)
    }

    pub(crate) fn f32(&mut self) -> Option<f32> {
        self.array().map(f32::from_le_bytes)
    }

    pub(crate) fn f64(&mut self) -> Option<f64> {
        self.array().map(f64::from_le_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_bool_columns_decode() {
        let col = Column::Text(vec!["grass".to_owned(), String::new(), "moss".to_owned()]);
        let mut raw = Vec::new();
        col.encode_into(&mut raw);
        let decoded = Column::decode(ColumnType::Text, &mut ByteReader::new(&raw), 3).unwrap();
        assert_eq!(decoded, col);

        let col = Column::Bool(vec![true, false, true]);
        let mut raw = Vec::new();
        col.encode_into(&mut raw);
        assert_eq!(raw, vec![1, 0, 1]);
    }

    #[test]
    fn truncated_buffer_fails_to_decode() {
        let mut raw = Vec::new();
        Column::U64(vec![1, 2]).encode_into(&mut raw);
        raw.pop();
        assert!(Column::decode(ColumnType::U64, &mut ByteReader::new(&raw), 2).is_none());
    }

    #[test]
    fn field_column_tracks_absent_rows() {
        let mut col = FieldColumn::new(ValueType::Int);
        assert!(col.push(0, Some(&Value::Int(1))));
        assert!(col.push(1, None));
        assert!(col.push(2, Some(&Value::Int(3))));
        assert!(!col.push(3, Some(&Value::Float(1.0))));
        assert_eq!(col.present, vec![true, false, true]);
        assert_eq!(col.present_count(), 2);

        let mut raw = Vec::new();
        col.encode_into(&mut raw);
        let decoded =
            FieldColumn::decode(ValueType::Int, &mut ByteReader::new(&raw), 3, 2).unwrap();
        assert_eq!(
            decoded.rows(3),
            vec![Some(Value::Int(1)), None, Some(Value::Int(3))]
        );
    }

    #[test]
    fn fully_present_column_has_no_flags() {
        let mut col = FieldColumn::new(ValueType::Float);
        col.push(0, Some(&Value::Float(0.5)));
        col.push(1, Some(&Value::Float(1.5)));
        assert!(col.present.is_empty());
        let mut raw = Vec::new();
        col.encode_into(&mut raw);
        assert_eq!(raw.len(), 16);
    }

    #[test]
    fn compression_round_trips() {
        let raw: Vec<u8> = std::iter::repeat(7u8).take(4096).collect();
        let blob = compress(&raw, 3).unwrap();
        assert!(blob.len() < raw.len());
        assert_eq!(decompress(&blob, 0).unwrap(), raw);
    }
}
