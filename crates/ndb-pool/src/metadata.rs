//! Table metadata as returned by the dictionary, and default-value decoding.
//!
//! The native dictionary hands back each column's default in its on-disk
//! encoding. [`decode_table`] converts a [`RawTable`] into [`TableMetadata`]
//! with a typed [`DefaultValue`] per column. It runs once per successful
//! fetch, before the result is shared with every waiter.

use serde::{Deserialize, Serialize};

use crate::error::DictionaryError;

/// NDB column storage types the pool knows how to decode defaults for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Tinyint,
    TinyUnsigned,
    Smallint,
    SmallUnsigned,
    Mediumint,
    MediumUnsigned,
    Int,
    Unsigned,
    Bigint,
    BigUnsigned,
    Float,
    Double,
    Char,
    Varchar,
    Longvarchar,
    Binary,
    Varbinary,
    Longvarbinary,
    Year,
    Date,
    Time,
    Datetime,
    Timestamp,
    Bit,
    Blob,
    Text,
}

/// Column definition exactly as the dictionary reports it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawColumn {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    /// Declared length for character and binary columns.
    #[serde(default)]
    pub length: u32,
    /// Default value in native encoding, absent when the column has none.
    #[serde(default)]
    pub raw_default: Option<Vec<u8>>,
}

/// Table definition exactly as the dictionary reports it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawTable {
    pub database: String,
    pub name: String,
    #[serde(default)]
    pub columns: Vec<RawColumn>,
}

/// A decoded column default.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TypedValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Temporal values rendered in MySQL literal form (`2024-01-31`,
    /// `-12:30:00`, `2024-01-31 08:00:00`).
    Temporal(String),
}

/// The default of a column after decoding.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    /// The column declares a default.
    Value(TypedValue),
    /// Nullable column without a declared default.
    Null,
    /// Non-nullable column without a declared default.
    Undefined,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub length: u32,
    pub default: DefaultValue,
}

/// Table metadata handed to callers of `get_table_metadata`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TableMetadata {
    pub database: String,
    pub name: String,
    pub columns: Vec<Column>,
}

impl TableMetadata {
    /// `database.table`, the key used for pending metadata lookups.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Decode every column default of `raw`.
pub fn decode_table(raw: RawTable) -> Result<TableMetadata, DictionaryError> {
    let columns = raw
        .columns
        .into_iter()
        .map(|col| {
            let default = decode_default(&col).map_err(|reason| DictionaryError::InvalidDefault {
                column: format!("{}.{}.{}", raw.database, raw.name, col.name),
                reason,
            })?;
            Ok(Column {
                name: col.name,
                column_type: col.column_type,
                nullable: col.nullable,
                primary_key: col.primary_key,
                length: col.length,
                default,
            })
        })
        .collect::<Result<Vec<_>, DictionaryError>>()?;

    Ok(TableMetadata {
        database: raw.database,
        name: raw.name,
        columns,
    })
}

/// Decode the default of a single column.
pub fn decode_default(column: &RawColumn) -> Result<DefaultValue, String> {
    match column.raw_default.as_deref() {
        Some(raw) => decode_value(column.column_type, raw).map(DefaultValue::Value),
        None if column.nullable => Ok(DefaultValue::Null),
        None => Ok(DefaultValue::Undefined),
    }
}

fn decode_value(column_type: ColumnType, raw: &[u8]) -> Result<TypedValue, String> {
    use ColumnType::*;

    let value = match column_type {
        Tinyint => TypedValue::Int(i8::from_le_bytes(take::<1>(raw)?) as i64),
        TinyUnsigned => TypedValue::UInt(raw_u8(raw)? as u64),
        Smallint => TypedValue::Int(i16::from_le_bytes(take::<2>(raw)?) as i64),
        SmallUnsigned => TypedValue::UInt(u16::from_le_bytes(take::<2>(raw)?) as u64),
        Mediumint => TypedValue::Int(int24(raw)? as i64),
        MediumUnsigned => TypedValue::UInt(uint24(raw)? as u64),
        Int => TypedValue::Int(i32::from_le_bytes(take::<4>(raw)?) as i64),
        Unsigned => TypedValue::UInt(u32::from_le_bytes(take::<4>(raw)?) as u64),
        Bigint => TypedValue::Int(i64::from_le_bytes(take::<8>(raw)?)),
        BigUnsigned => TypedValue::UInt(u64::from_le_bytes(take::<8>(raw)?)),
        Float => TypedValue::Float(f32::from_le_bytes(take::<4>(raw)?) as f64),
        Double => TypedValue::Float(f64::from_le_bytes(take::<8>(raw)?)),
        // Fixed-width character columns are space padded.
        Char => TypedValue::Text(utf8(raw)?.trim_end_matches(' ').to_string()),
        Varchar => TypedValue::Text(utf8(length_prefixed(raw, 1)?)?.to_string()),
        Longvarchar => TypedValue::Text(utf8(length_prefixed(raw, 2)?)?.to_string()),
        Binary => TypedValue::Bytes(raw.to_vec()),
        Varbinary => TypedValue::Bytes(length_prefixed(raw, 1)?.to_vec()),
        Longvarbinary => TypedValue::Bytes(length_prefixed(raw, 2)?.to_vec()),
        Year => TypedValue::UInt(1900 + raw_u8(raw)? as u64),
        Date => {
            let packed = uint24(raw)?;
            TypedValue::Temporal(format!(
                "{:04}-{:02}-{:02}",
                packed >> 9,
                (packed >> 5) & 0x0f,
                packed & 0x1f
            ))
        }
        Time => {
            let packed = int24(raw)?;
            let sign = if packed < 0 { "-" } else { "" };
            let hms = packed.unsigned_abs();
            TypedValue::Temporal(format!(
                "{sign}{:02}:{:02}:{:02}",
                hms / 10_000,
                (hms / 100) % 100,
                hms % 100
            ))
        }
        Datetime => {
            let packed = u64::from_le_bytes(take::<8>(raw)?);
            let date = packed / 1_000_000;
            let time = packed % 1_000_000;
            TypedValue::Temporal(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                date / 10_000,
                (date / 100) % 100,
                date % 100,
                time / 10_000,
                (time / 100) % 100,
                time % 100
            ))
        }
        Timestamp => TypedValue::UInt(u32::from_le_bytes(take::<4>(raw)?) as u64),
        Bit => {
            if raw.len() > 8 {
                return Err(format!("bit default of {} bytes exceeds 64 bits", raw.len()));
            }
            let mut buf = [0u8; 8];
            buf[..raw.len()].copy_from_slice(raw);
            TypedValue::UInt(u64::from_le_bytes(buf))
        }
        Blob | Text => return Err("BLOB and TEXT columns cannot carry a default".to_string()),
    };
    Ok(value)
}

fn take<const N: usize>(raw: &[u8]) -> Result<[u8; N], String> {
    raw.get(..N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| format!("expected {N} bytes, got {}", raw.len()))
}

fn raw_u8(raw: &[u8]) -> Result<u8, String> {
    Ok(take::<1>(raw)?[0])
}

fn uint24(raw: &[u8]) -> Result<u32, String> {
    let [a, b, c] = take::<3>(raw)?;
    Ok(u32::from_le_bytes([a, b, c, 0]))
}

fn int24(raw: &[u8]) -> Result<i32, String> {
    // Shift into the high bytes and back to sign-extend.
    Ok(((uint24(raw)? << 8) as i32) >> 8)
}

fn length_prefixed(raw: &[u8], prefix: usize) -> Result<&[u8], String> {
    let len = match prefix {
        1 => raw_u8(raw)? as usize,
        _ => u16::from_le_bytes(take::<2>(raw)?) as usize,
    };
    raw.get(prefix..prefix + len)
        .ok_or_else(|| format!("length prefix {len} overruns {} byte value", raw.len()))
}

fn utf8(raw: &[u8]) -> Result<&str, String> {
    std::str::from_utf8(raw).map_err(|e| format!("invalid UTF-8: {e}"))
}
