//! Typed field values, field tables and field arrays
//!
//! Every field on the wire is discriminated by a one byte type code. The
//! recognized codes are the set RabbitMQ brokers actually produce:
//!
//! ```text
//! t bool      b i8    B u8     U i16    u u16    I i32    i u32
//! L i64       l u64   f f32    d f64    D decimal
//! s short string      S long string     A array
//! T timestamp         F table           V void
//! ```

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::read::ReadBuffer;
use crate::write::{finish_length_prefix, put_long_bytes, put_short_string, start_length_prefix};
use crate::Error;

/// A decimal field: a value scaled by a power of ten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    /// Number of decimal digits after the point
    pub scale: u8,
    /// The scaled value
    pub value: i32,
}

/// A field value in a table or array
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Code `t`
    Boolean(bool),
    /// Code `b`
    I8(i8),
    /// Code `B`
    U8(u8),
    /// Code `U`
    I16(i16),
    /// Code `u`
    U16(u16),
    /// Code `I`
    I32(i32),
    /// Code `i`
    U32(u32),
    /// Code `L`
    I64(i64),
    /// Code `l`
    U64(u64),
    /// Code `f`
    F32(f32),
    /// Code `d`
    F64(f64),
    /// Code `D`
    Decimal(Decimal),
    /// Code `s`: at most 255 bytes of utf-8
    ShortString(String),
    /// Code `S`: arbitrary bytes with a 32 bit length
    LongString(Bytes),
    /// Code `A`
    Array(Array),
    /// Code `T`: seconds since the unix epoch
    Timestamp(u64),
    /// Code `F`
    Table(Table),
    /// Code `V`
    Void,
}

impl Value {
    /// The one byte type code this value is tagged with on the wire
    pub fn type_code(&self) -> u8 {
        match self {
            Value::Boolean(_) => b't',
            Value::I8(_) => b'b',
            Value::U8(_) => b'B',
            Value::I16(_) => b'U',
            Value::U16(_) => b'u',
            Value::I32(_) => b'I',
            Value::U32(_) => b'i',
            Value::I64(_) => b'L',
            Value::U64(_) => b'l',
            Value::F32(_) => b'f',
            Value::F64(_) => b'd',
            Value::Decimal(_) => b'D',
            Value::ShortString(_) => b's',
            Value::LongString(_) => b'S',
            Value::Array(_) => b'A',
            Value::Timestamp(_) => b'T',
            Value::Table(_) => b'F',
            Value::Void => b'V',
        }
    }

    /// Encode the type code followed by the value
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        buf.put_u8(self.type_code());
        match self {
            Value::Boolean(v) => buf.put_u8(u8::from(*v)),
            Value::I8(v) => buf.put_i8(*v),
            Value::U8(v) => buf.put_u8(*v),
            Value::I16(v) => buf.put_i16(*v),
            Value::U16(v) => buf.put_u16(*v),
            Value::I32(v) => buf.put_i32(*v),
            Value::U32(v) => buf.put_u32(*v),
            Value::I64(v) => buf.put_i64(*v),
            Value::U64(v) => buf.put_u64(*v),
            Value::F32(v) => buf.put_f32(*v),
            Value::F64(v) => buf.put_f64(*v),
            Value::Decimal(v) => {
                buf.put_u8(v.scale);
                buf.put_i32(v.value);
            }
            Value::ShortString(v) => put_short_string(buf, v)?,
            Value::LongString(v) => put_long_bytes(buf, v),
            Value::Array(v) => v.encode(buf)?,
            Value::Timestamp(v) => buf.put_u64(*v),
            Value::Table(v) => v.encode(buf)?,
            Value::Void => {}
        }
        Ok(())
    }

    /// Decode a value given its already consumed type code.
    ///
    /// An unrecognized code returns `None`: the field cannot be decoded and
    /// neither can anything that follows it in the same table, so the caller
    /// skips the rest of the enclosing table or array without error. This
    /// keeps the codec tolerant of broker extensions.
    pub fn decode(code: u8, buffer: &mut ReadBuffer<'_>) -> Result<Option<Value>, Error> {
        let value = match code {
            b't' => Value::Boolean(buffer.next_u8()? != 0),
            b'b' => Value::I8(buffer.next_i8()?),
            b'B' => Value::U8(buffer.next_u8()?),
            b'U' => Value::I16(buffer.next_i16()?),
            b'u' => Value::U16(buffer.next_u16()?),
            b'I' => Value::I32(buffer.next_i32()?),
            b'i' => Value::U32(buffer.next_u32()?),
            b'L' => Value::I64(buffer.next_i64()?),
            b'l' => Value::U64(buffer.next_u64()?),
            b'f' => Value::F32(buffer.next_f32()?),
            b'd' => Value::F64(buffer.next_f64()?),
            b'D' => Value::Decimal(Decimal {
                scale: buffer.next_u8()?,
                value: buffer.next_i32()?,
            }),
            b's' => Value::ShortString(buffer.short_string()?),
            b'S' => Value::LongString(buffer.long_bytes()?),
            b'A' => Value::Array(Array::decode(buffer)?),
            b'T' => Value::Timestamp(buffer.next_u64()?),
            b'F' => Value::Table(Table::decode(buffer)?),
            b'V' => Value::Void,
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::LongString(Bytes::copy_from_slice(v.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::LongString(Bytes::from(v.into_bytes()))
    }
}

impl From<Table> for Value {
    fn from(v: Table) -> Self {
        Value::Table(v)
    }
}

/// An unordered map from short-string keys to field values
///
/// Serialized as a 32 bit byte length followed by `key, type code, value`
/// entries. Key order is not meaningful on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table(BTreeMap<String, Value>);

impl Table {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field, replacing any previous value under the same key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Encode the table including its length prefix
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        let prefix = start_length_prefix(buf);
        for (key, value) in &self.0 {
            put_short_string(buf, key)?;
            value.encode(buf)?;
        }
        finish_length_prefix(buf, prefix);
        Ok(())
    }

    /// Decode a table from its length prefix onward
    pub fn decode(buffer: &mut ReadBuffer<'_>) -> Result<Table, Error> {
        let len = buffer.next_u32()? as usize;
        let raw = buffer.next_bytes(len)?;
        let mut inner = ReadBuffer::new(raw);
        let mut table = Table::new();
        while inner.remaining() > 0 {
            let key = inner.short_string().map_err(bounded)?;
            let code = inner.next_u8().map_err(bounded)?;
            match Value::decode(code, &mut inner).map_err(bounded)? {
                Some(value) => table.insert(key, value),
                // unknown field type: the rest of the table is unparseable
                None => break,
            }
        }
        Ok(table)
    }
}

impl FromIterator<(String, Value)> for Table {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Table(iter.into_iter().collect())
    }
}

/// An ordered sequence of field values
///
/// Serialized as a 32 bit byte length followed by `type code, value` items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Array(pub Vec<Value>);

impl Array {
    /// Encode the array including its length prefix
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        let prefix = start_length_prefix(buf);
        for value in &self.0 {
            value.encode(buf)?;
        }
        finish_length_prefix(buf, prefix);
        Ok(())
    }

    /// Decode an array from its length prefix onward
    pub fn decode(buffer: &mut ReadBuffer<'_>) -> Result<Array, Error> {
        let len = buffer.next_u32()? as usize;
        let raw = buffer.next_bytes(len)?;
        let mut inner = ReadBuffer::new(raw);
        let mut items = Vec::new();
        while inner.remaining() > 0 {
            let code = inner.next_u8().map_err(bounded)?;
            match Value::decode(code, &mut inner).map_err(bounded)? {
                Some(value) => items.push(value),
                None => break,
            }
        }
        Ok(Array(items))
    }
}

// A truncation inside a length-bounded region is a framing error, not a
// request for more data.
fn bounded(err: Error) -> Error {
    match err {
        Error::Truncated => Error::Malformed("field table"),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) -> Value {
        let mut buf = BytesMut::new();
        value.encode(&mut buf).unwrap();
        let mut buffer = ReadBuffer::new(&buf);
        let code = buffer.next_u8().unwrap();
        let decoded = Value::decode(code, &mut buffer).unwrap().unwrap();
        assert_eq!(buffer.remaining(), 0);
        decoded
    }

    #[test]
    fn scalar_roundtrips() {
        for value in [
            Value::Boolean(true),
            Value::I8(-5),
            Value::U8(200),
            Value::I16(-300),
            Value::U16(40000),
            Value::I32(-70000),
            Value::U32(3_000_000_000),
            Value::I64(-1),
            Value::U64(u64::MAX),
            Value::F32(1.5),
            Value::F64(-2.25),
            Value::Decimal(Decimal { scale: 2, value: -12345 }),
            Value::Timestamp(1_500_000_000),
            Value::Void,
        ] {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn string_roundtrips() {
        assert_eq!(
            roundtrip(Value::ShortString("hello".into())),
            Value::ShortString("hello".into())
        );
        assert_eq!(roundtrip(Value::from("binary ok")), Value::from("binary ok"));
    }

    #[test]
    fn nested_table_roundtrips() {
        let mut inner = Table::new();
        inner.insert("x-depth", 2i32);
        let mut table = Table::new();
        table.insert("name", "queue");
        table.insert("durable", true);
        table.insert("nested", inner);
        table.insert("items", Value::Array(Array(vec![Value::U8(1), Value::U8(2)])));
        assert_eq!(roundtrip(Value::Table(table.clone())), Value::Table(table));
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut a = Table::new();
        a.insert("one", 1i32);
        a.insert("two", 2i32);
        let mut b = Table::new();
        b.insert("two", 2i32);
        b.insert("one", 1i32);
        let mut encoded_a = BytesMut::new();
        let mut encoded_b = BytesMut::new();
        a.encode(&mut encoded_a).unwrap();
        b.encode(&mut encoded_b).unwrap();
        assert_eq!(encoded_a, encoded_b);
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_field_type_drops_remainder_without_error() {
        let mut buf = BytesMut::new();
        let prefix = start_length_prefix(&mut buf);
        put_short_string(&mut buf, "known").unwrap();
        Value::I32(7).encode(&mut buf).unwrap();
        put_short_string(&mut buf, "strange").unwrap();
        buf.extend_from_slice(&[b'x', 0xde, 0xad]);
        finish_length_prefix(&mut buf, prefix);

        let mut buffer = ReadBuffer::new(&buf);
        let table = Table::decode(&mut buffer).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("known"), Some(&Value::I32(7)));
        // the whole declared table region was consumed
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn oversized_inner_length_is_malformed() {
        // table claims 100 bytes but the key inside claims even more
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.extend_from_slice(&[250, b'a', b'b', b'c', b'd', b'e', b'f', b'g']);
        let mut buffer = ReadBuffer::new(&buf);
        assert!(matches!(
            Table::decode(&mut buffer),
            Err(Error::Malformed(_))
        ));
    }
}
