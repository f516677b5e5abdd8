//! The `@UTF` columnar metadata-table codec (component C2 of the design).
//!
//! A table is a signature, a 24-byte header of pool offsets/counts, a row of
//! column descriptors, an optional row-values area, a string pool and a byte
//! pool. Columns can be stored `Zero` (implicit, no bytes on disk), `Constant`
//! (one value for every row, stored once in the descriptor) or `PerRow` (one
//! value per row in the row-values area).

use encoding_rs::Encoding;
use litemap::LiteMap;

use crate::encoding;
use crate::error::{Result, UsmError};
use crate::io::{ByteReader, ByteWriter};

const SIGNATURE: &[u8; 4] = b"@UTF";
const HEADER_LEN: usize = 24;

fn malformed(reason: impl Into<String>) -> UsmError {
    UsmError::MalformedTable {
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    String,
    Bytes,
}

impl TypeTag {
    fn from_nibble(n: u8) -> Result<TypeTag> {
        Ok(match n {
            0 => TypeTag::U8,
            1 => TypeTag::I8,
            2 => TypeTag::U16,
            3 => TypeTag::I16,
            4 => TypeTag::U32,
            5 => TypeTag::I32,
            6 => TypeTag::U64,
            7 => TypeTag::I64,
            8 => TypeTag::F32,
            9 => TypeTag::F64,
            10 => TypeTag::String,
            11 => TypeTag::Bytes,
            other => return Err(malformed(format!("unknown type tag {other}"))),
        })
    }

    fn to_nibble(self) -> u8 {
        match self {
            TypeTag::U8 => 0,
            TypeTag::I8 => 1,
            TypeTag::U16 => 2,
            TypeTag::I16 => 3,
            TypeTag::U32 => 4,
            TypeTag::I32 => 5,
            TypeTag::U64 => 6,
            TypeTag::I64 => 7,
            TypeTag::F32 => 8,
            TypeTag::F64 => 9,
            TypeTag::String => 10,
            TypeTag::Bytes => 11,
        }
    }

    /// Fixed on-disk width of one row-area or constant-descriptor value.
    fn width(self) -> usize {
        match self {
            TypeTag::U8 | TypeTag::I8 => 1,
            TypeTag::U16 | TypeTag::I16 => 2,
            TypeTag::U32 | TypeTag::I32 | TypeTag::F32 => 4,
            TypeTag::U64 | TypeTag::I64 | TypeTag::F64 => 8,
            TypeTag::String => 4,
            TypeTag::Bytes => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::U8(v) => Some(v as u64),
            Value::U16(v) => Some(v as u64),
            Value::U32(v) => Some(v as u64),
            Value::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnStorage {
    /// Column is implicitly zero/empty for every row; nothing stored on disk.
    Zero,
    /// One value, shared by every row, stored inline in the descriptor.
    Constant(Value),
    /// One value per row, stored in the row-values area.
    PerRow,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub type_tag: TypeTag,
    pub storage: ColumnStorage,
}

/// A decoded `@UTF` table. `rows` holds every column's *resolved* value for
/// every row (Zero/Constant columns are broadcast), while `columns` retains
/// the original storage mode so the table can be re-encoded in the same
/// layout it was read in.
#[derive(Debug, Clone)]
pub struct UtfTable {
    pub name: String,
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
}

impl UtfTable {
    pub fn new(name: impl Into<String>) -> Self {
        UtfTable {
            name: name.into(),
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }

    /// A column's value regardless of row count: the descriptor's constant
    /// for `Constant` columns (even with zero rows), otherwise the first
    /// row's value.
    pub fn scalar(&self, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        match &self.columns[idx].storage {
            ColumnStorage::Constant(v) => Some(v),
            _ => self.rows.first()?.get(idx),
        }
    }

    /// Parses a complete `@UTF` table starting at `data[0]` (the `@UTF`
    /// signature), decoding payload strings (column `String` values) as
    /// [`encoding::DEFAULT`]. Structural names (table/column names) are
    /// always UTF-8.
    pub fn decode(data: &[u8]) -> Result<UtfTable> {
        Self::decode_with_encoding(data, encoding::DEFAULT)
    }

    /// Like [`UtfTable::decode`], but decodes payload strings using `enc`
    /// (e.g. `shift-jis` for Japanese filenames, per the `--encoding` CLI flag).
    pub fn decode_with_encoding(data: &[u8], enc: &'static Encoding) -> Result<UtfTable> {
        let mut r = ByteReader::new(data);
        let mut sig = [0u8; 4];
        sig.copy_from_slice(r.read_bytes(4)?);
        if &sig != SIGNATURE {
            return Err(malformed("missing @UTF signature"));
        }
        let table_size = r.read_u32()? as usize;
        if table_size + 8 > data.len() {
            return Err(malformed("table size exceeds buffer"));
        }
        // Everything from here is relative to the byte right after `size`.
        let mut body = ByteReader::new(&data[8..8 + table_size]);
        let mut h = ByteReader::new(body.read_bytes(HEADER_LEN)?);

        let rows_offset = h.read_u32()? as usize;
        let strings_offset = h.read_u32()? as usize;
        let bytes_offset = h.read_u32()? as usize;
        let name_offset = h.read_u32()? as usize;
        let column_count = h.read_u16()? as usize;
        let row_stride = h.read_u16()? as usize;
        let row_count = h.read_u32()? as usize;

        if strings_offset > table_size || bytes_offset > table_size {
            return Err(malformed("pool offset past end of table"));
        }

        let strings_pool = &data[8 + strings_offset..8 + table_size];
        let bytes_pool = &data[8 + bytes_offset..8 + table_size];

        let string_at = |off: usize| -> Result<String> {
            let r = ByteReader::new(strings_pool);
            let raw = r.cstr_at(off)?;
            Ok(String::from_utf8_lossy(raw).into_owned())
        };

        let name = string_at(name_offset)?;

        let mut columns = Vec::with_capacity(column_count);
        let mut desc_reader = ByteReader::new(&data[8 + HEADER_LEN..8 + table_size]);
        let mut stride_check = 0usize;

        for _ in 0..column_count {
            let packed = desc_reader.read_u8()?;
            let storage_nibble = packed >> 4;
            let type_tag = TypeTag::from_nibble(packed & 0x0F)?;
            let col_name_offset = desc_reader.read_u32()? as usize;
            let col_name = string_at(col_name_offset)?;

            let storage = match storage_nibble {
                0x1 => ColumnStorage::Zero,
                0x3 => {
                    let value =
                        read_scalar(&mut desc_reader, type_tag, strings_pool, bytes_pool, enc)?;
                    ColumnStorage::Constant(value)
                }
                0x5 => {
                    stride_check += type_tag.width();
                    ColumnStorage::PerRow
                }
                other => return Err(malformed(format!("unknown storage mode 0x{other:x}"))),
            };

            columns.push(Column {
                name: col_name,
                type_tag,
                storage,
            });
        }

        if stride_check != row_stride {
            return Err(malformed(format!(
                "row stride mismatch: header says {row_stride}, columns imply {stride_check}"
            )));
        }
        if rows_offset + row_stride * row_count > strings_offset {
            return Err(malformed("row-values area overruns string pool"));
        }

        let mut rows = Vec::with_capacity(row_count);
        let row_area = &data[8 + rows_offset..8 + strings_offset];
        let mut row_reader = ByteReader::new(row_area);

        for _ in 0..row_count {
            let mut row = Vec::with_capacity(column_count);
            for col in &columns {
                let value = match &col.storage {
                    ColumnStorage::Zero => zero_value(col.type_tag),
                    ColumnStorage::Constant(v) => v.clone(),
                    ColumnStorage::PerRow => read_scalar(
                        &mut row_reader,
                        col.type_tag,
                        strings_pool,
                        bytes_pool,
                        enc,
                    )?,
                };
                row.push(value);
            }
            rows.push(row);
        }

        Ok(UtfTable {
            name,
            columns,
            rows,
        })
    }

    /// Serializes this table back into canonical `@UTF` bytes using
    /// [`encoding::DEFAULT`] for payload strings.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_with_encoding(encoding::DEFAULT)
    }

    /// Like [`UtfTable::encode`], but encodes payload strings (column
    /// `String` values) using `enc`. Structural names (table/column names)
    /// are always written as UTF-8.
    ///
    /// Serializes this table back into canonical `@UTF` bytes: header,
    /// column descriptors, row-values area, string pool, byte pool, each
    /// section laid out contiguously with no inter-section padding.
    ///
    /// This layout is canonical, not a copy of whatever layout the table was
    /// decoded from: section order and string-pool deduplication are fixed
    /// choices, so `encode(decode(b)) == b` bitwise only holds when `b` was
    /// itself produced by this encoder. A foreign `@UTF` table with a
    /// different section order, padding, or pool arrangement round-trips at
    /// the object level (same columns, same values) but not necessarily byte
    /// for byte.
    pub fn encode_with_encoding(&self, enc: &'static Encoding) -> Result<Vec<u8>> {
        let mut strings = StringPool::default();
        let name_offset = strings.intern(&self.name);
        for col in &self.columns {
            strings.intern(&col.name);
        }

        let mut bytes_pool: Vec<u8> = Vec::new();
        let row_stride: usize = self
            .columns
            .iter()
            .filter(|c| matches!(c.storage, ColumnStorage::PerRow))
            .map(|c| c.type_tag.width())
            .sum();

        // Column descriptors, and constant values collected while interning.
        let mut desc = ByteWriter::new();
        for col in &self.columns {
            let (storage_nibble, constant) = match &col.storage {
                ColumnStorage::Zero => (0x1u8, None),
                ColumnStorage::Constant(v) => (0x3u8, Some(v.clone())),
                ColumnStorage::PerRow => (0x5u8, None),
            };
            desc.write_u8((storage_nibble << 4) | col.type_tag.to_nibble());
            desc.write_u32(strings.intern(&col.name) as u32);
            if let Some(value) = constant {
                write_scalar(&mut desc, &value, &mut strings, &mut bytes_pool, enc)?;
            }
        }

        // Row-values area.
        let mut row_area = ByteWriter::new();
        for row in &self.rows {
            for (col, value) in self.columns.iter().zip(row.iter()) {
                if matches!(col.storage, ColumnStorage::PerRow) {
                    write_scalar(&mut row_area, value, &mut strings, &mut bytes_pool, enc)?;
                }
            }
        }

        let rows_offset = HEADER_LEN + desc.position();
        let strings_offset = rows_offset + row_area.position();
        let string_pool_bytes = strings.finish();
        let bytes_offset = strings_offset + string_pool_bytes.len();

        let mut header = ByteWriter::new();
        header.write_u32(rows_offset as u32);
        header.write_u32(strings_offset as u32);
        header.write_u32(bytes_offset as u32);
        header.write_u32(name_offset as u32);
        header.write_u16(self.columns.len() as u16);
        header.write_u16(row_stride as u16);
        header.write_u32(self.rows.len() as u32);

        let mut body = ByteWriter::with_capacity(bytes_offset + bytes_pool.len());
        body.write_bytes(header.as_slice());
        body.write_bytes(desc.as_slice());
        body.write_bytes(row_area.as_slice());
        body.write_bytes(&string_pool_bytes);
        body.write_bytes(&bytes_pool);

        let mut out = ByteWriter::with_capacity(body.position() + 8);
        out.write_bytes(SIGNATURE);
        out.write_u32(body.position() as u32);
        out.write_bytes(body.as_slice());
        Ok(out.into_vec())
    }
}

fn zero_value(tag: TypeTag) -> Value {
    match tag {
        TypeTag::U8 => Value::U8(0),
        TypeTag::I8 => Value::I8(0),
        TypeTag::U16 => Value::U16(0),
        TypeTag::I16 => Value::I16(0),
        TypeTag::U32 => Value::U32(0),
        TypeTag::I32 => Value::I32(0),
        TypeTag::U64 => Value::U64(0),
        TypeTag::I64 => Value::I64(0),
        TypeTag::F32 => Value::F32(0.0),
        TypeTag::F64 => Value::F64(0.0),
        TypeTag::String => Value::String(String::new()),
        TypeTag::Bytes => Value::Bytes(Vec::new()),
    }
}

fn read_scalar(
    r: &mut ByteReader<'_>,
    tag: TypeTag,
    strings_pool: &[u8],
    bytes_pool: &[u8],
    enc: &'static Encoding,
) -> Result<Value> {
    Ok(match tag {
        TypeTag::U8 => Value::U8(r.read_u8()?),
        TypeTag::I8 => Value::I8(r.read_i8()?),
        TypeTag::U16 => Value::U16(r.read_u16()?),
        TypeTag::I16 => Value::I16(r.read_i16()?),
        TypeTag::U32 => Value::U32(r.read_u32()?),
        TypeTag::I32 => Value::I32(r.read_i32()?),
        TypeTag::U64 => Value::U64(r.read_u64()?),
        TypeTag::I64 => Value::I64(r.read_i64()?),
        TypeTag::F32 => Value::F32(r.read_f32()?),
        TypeTag::F64 => Value::F64(r.read_f64()?),
        TypeTag::String => {
            // Payload string: decoded with the caller-chosen encoding, not
            // assumed UTF-8 (structural names are read separately as UTF-8).
            let offset = r.read_u32()? as usize;
            let pool_reader = ByteReader::new(strings_pool);
            let raw = pool_reader.cstr_at(offset)?;
            let (decoded, _, _) = enc.decode(raw);
            Value::String(decoded.into_owned())
        }
        TypeTag::Bytes => {
            let offset = r.read_u32()? as usize;
            let len = r.read_u32()? as usize;
            let pool_reader = ByteReader::new(bytes_pool);
            Value::Bytes(pool_reader.bytes_at(offset, len)?.to_vec())
        }
    })
}

fn write_scalar(
    w: &mut ByteWriter,
    value: &Value,
    strings: &mut StringPool,
    bytes_pool: &mut Vec<u8>,
    enc: &'static Encoding,
) -> Result<()> {
    match value {
        Value::U8(v) => w.write_u8(*v),
        Value::I8(v) => w.write_u8(*v as u8),
        Value::U16(v) => w.write_u16(*v),
        Value::I16(v) => w.write_u16(*v as u16),
        Value::U32(v) => w.write_u32(*v),
        Value::I32(v) => w.write_u32(*v as u32),
        Value::U64(v) => w.write_u64(*v),
        Value::I64(v) => w.write_u64(*v as u64),
        Value::F32(v) => w.write_f32(*v),
        Value::F64(v) => w.write_f64(*v),
        Value::String(s) => {
            let (encoded, _, _) = enc.encode(s);
            w.write_u32(strings.intern_bytes(&encoded) as u32)
        }
        Value::Bytes(b) => {
            let offset = bytes_pool.len();
            bytes_pool.extend_from_slice(b);
            w.write_u32(offset as u32);
            w.write_u32(b.len() as u32);
        }
    }
    Ok(())
}

/// NUL-terminated string interner. Identical byte sequences are deduplicated
/// so that re-encoding a table decoded with repeated strings (a common case
/// for per-row filenames sharing an extension, or column names reused across
/// tables) does not grow the pool unnecessarily. Structural names are
/// interned as their UTF-8 bytes; payload strings are interned pre-encoded
/// in the table's chosen character encoding.
#[derive(Default)]
struct StringPool {
    buf: Vec<u8>,
    offsets: LiteMap<Vec<u8>, usize>,
}

impl StringPool {
    fn intern(&mut self, s: &str) -> usize {
        self.intern_bytes(s.as_bytes())
    }

    fn intern_bytes(&mut self, raw: &[u8]) -> usize {
        if let Some(&offset) = self.offsets.get(raw) {
            return offset;
        }
        let offset = self.buf.len();
        self.buf.extend_from_slice(raw);
        self.buf.push(0);
        self.offsets.insert(raw.to_vec(), offset);
        offset
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> UtfTable {
        let mut t = UtfTable::new("CRID");
        t.columns.push(Column {
            name: "fmtver".to_string(),
            type_tag: TypeTag::U32,
            storage: ColumnStorage::Constant(Value::U32(0x15050001)),
        });
        t.columns.push(Column {
            name: "filename".to_string(),
            type_tag: TypeTag::String,
            storage: ColumnStorage::PerRow,
        });
        t.columns.push(Column {
            name: "filesize".to_string(),
            type_tag: TypeTag::U32,
            storage: ColumnStorage::PerRow,
        });
        t.columns.push(Column {
            name: "unused".to_string(),
            type_tag: TypeTag::U32,
            storage: ColumnStorage::Zero,
        });
        t.rows.push(vec![
            Value::U32(0x15050001),
            Value::String("video_0.vp9".to_string()),
            Value::U32(1234),
            Value::U32(0),
        ]);
        t.rows.push(vec![
            Value::U32(0x15050001),
            Value::String("audio_0.hca".to_string()),
            Value::U32(5678),
            Value::U32(0),
        ]);
        t
    }

    #[test]
    fn round_trips_mixed_storage_modes() {
        let table = sample_table();
        let bytes = table.encode().unwrap();
        let decoded = UtfTable::decode(&bytes).unwrap();

        assert_eq!(decoded.name, "CRID");
        assert_eq!(decoded.row_count(), 2);
        assert_eq!(
            decoded.get(0, "filename").unwrap().as_str(),
            Some("video_0.vp9")
        );
        assert_eq!(decoded.get(1, "filesize").unwrap().as_u64(), Some(5678));
        assert_eq!(decoded.get(0, "unused").unwrap().as_u64(), Some(0));

        let bytes_again = decoded.encode().unwrap();
        assert_eq!(bytes, bytes_again);
    }

    #[test]
    fn zero_row_table_with_only_constants() {
        let mut t = UtfTable::new("EMPTY");
        t.columns.push(Column {
            name: "a".into(),
            type_tag: TypeTag::U8,
            storage: ColumnStorage::Constant(Value::U8(1)),
        });
        t.columns.push(Column {
            name: "b".into(),
            type_tag: TypeTag::U16,
            storage: ColumnStorage::Constant(Value::U16(2)),
        });
        t.columns.push(Column {
            name: "c".into(),
            type_tag: TypeTag::F32,
            storage: ColumnStorage::Constant(Value::F32(3.5)),
        });

        let bytes = t.encode().unwrap();
        let decoded = UtfTable::decode(&bytes).unwrap();
        assert_eq!(decoded.row_count(), 0);
        assert_eq!(decoded.columns.len(), 3);
    }

    #[test]
    fn rejects_strings_offset_past_table_size() {
        // Hand-crafted header with an impossible strings_offset.
        let mut body = ByteWriter::new();
        body.write_u32(24); // rows_offset
        body.write_u32(999_999); // strings_offset: way past the table
        body.write_u32(999_999); // bytes_offset
        body.write_u32(0); // name_offset
        body.write_u16(0); // column_count
        body.write_u16(0); // row_stride
        body.write_u32(0); // row_count

        let mut out = ByteWriter::new();
        out.write_bytes(b"@UTF");
        out.write_u32(body.position() as u32);
        out.write_bytes(body.as_slice());

        let err = UtfTable::decode(&out.into_vec()).unwrap_err();
        assert!(matches!(err, UsmError::MalformedTable { .. }));
    }
}
