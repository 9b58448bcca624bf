//! Value serializers mapping typed values to ERD bytes.
//!
//! Serializers are stateless and may be shared between any number of ERD
//! objects. Typed serializers ([`ScalarSerializer`], [`AsciiSerializer`],
//! [`HexSerializer`], [`RawSerializer`]) suit code that knows the value type
//! at compile time; [`DynamicSerializer`] picks the encoding at runtime from a
//! [`ValueKind`] name such as `"uint16"` or `"ascii"`.

use crate::error::ProtocolError;
use crate::stream::{Endian, StreamReader, StreamWriter};
use bytes::Bytes;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

/// Maps between a typed value and its byte representation.
pub trait Serializer: Send + Sync {
    type Value;

    fn serialize(&self, value: &Self::Value) -> Result<Bytes, ProtocolError>;

    fn deserialize(&self, data: &[u8]) -> Result<Self::Value, ProtocolError>;
}

/// Fixed-width integers readable from a [`StreamReader`].
pub trait Scalar: Copy + Send + Sync + 'static {
    const SIZE: usize;

    fn read(reader: &mut StreamReader<'_>) -> Self;

    fn write(self, writer: &mut StreamWriter);
}

macro_rules! scalar {
    ($ty:ty, $read:ident, $write:ident) => {
        impl Scalar for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn read(reader: &mut StreamReader<'_>) -> Self {
                reader.$read()
            }

            fn write(self, writer: &mut StreamWriter) {
                writer.$write(self)
            }
        }
    };
}

scalar!(u8, read_u8, write_u8);
scalar!(i8, read_i8, write_i8);
scalar!(u16, read_u16, write_u16);
scalar!(i16, read_i16, write_i16);
scalar!(u32, read_u32, write_u32);
scalar!(i32, read_i32, write_i32);
scalar!(u64, read_u64, write_u64);
scalar!(i64, read_i64, write_i64);

fn check_length(expected: usize, data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() != expected {
        return Err(ProtocolError::ValueLength {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Serializes one fixed-width integer.
#[derive(Debug, Clone, Copy)]
pub struct ScalarSerializer<T> {
    endian: Endian,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Scalar> ScalarSerializer<T> {
    pub fn new(endian: Endian) -> Self {
        Self {
            endian,
            _marker: PhantomData,
        }
    }
}

impl<T: Scalar> Default for ScalarSerializer<T> {
    fn default() -> Self {
        Self::new(Endian::default())
    }
}

impl<T: Scalar> Serializer for ScalarSerializer<T> {
    type Value = T;

    fn serialize(&self, value: &T) -> Result<Bytes, ProtocolError> {
        let mut writer = StreamWriter::new(T::SIZE, self.endian);
        value.write(&mut writer);
        Ok(writer.freeze())
    }

    fn deserialize(&self, data: &[u8]) -> Result<T, ProtocolError> {
        check_length(T::SIZE, data)?;
        Ok(T::read(&mut StreamReader::new(data, self.endian)))
    }
}

/// Serializes an ASCII string using its own length as the byte budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsciiSerializer;

impl Serializer for AsciiSerializer {
    type Value = String;

    fn serialize(&self, value: &String) -> Result<Bytes, ProtocolError> {
        if !value.is_ascii() {
            return Err(ProtocolError::InvalidValue(format!(
                "{:?} is not ASCII",
                value
            )));
        }
        let mut writer = StreamWriter::new(value.len(), Endian::Big);
        writer.write_ascii(value, value.len());
        Ok(writer.freeze())
    }

    fn deserialize(&self, data: &[u8]) -> Result<String, ProtocolError> {
        Ok(StreamReader::new(data, Endian::Big).read_ascii(data.len()))
    }
}

/// Serializes a hex string as the bytes it spells.
#[derive(Debug, Clone, Copy, Default)]
pub struct HexSerializer;

impl Serializer for HexSerializer {
    type Value = String;

    fn serialize(&self, value: &String) -> Result<Bytes, ProtocolError> {
        let mut writer = StreamWriter::new(value.len() / 2, Endian::Big);
        writer.write_hex(value)?;
        Ok(writer.freeze())
    }

    fn deserialize(&self, data: &[u8]) -> Result<String, ProtocolError> {
        Ok(StreamReader::new(data, Endian::Big).read_hex(data.len()))
    }
}

/// Passes bytes through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSerializer;

impl Serializer for RawSerializer {
    type Value = Bytes;

    fn serialize(&self, value: &Bytes) -> Result<Bytes, ProtocolError> {
        Ok(value.clone())
    }

    fn deserialize(&self, data: &[u8]) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Value encodings selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    Ascii,
    Hex,
    Raw,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::U8 => "uint8",
            ValueKind::U16 => "uint16",
            ValueKind::U32 => "uint32",
            ValueKind::U64 => "uint64",
            ValueKind::I8 => "int8",
            ValueKind::I16 => "int16",
            ValueKind::I32 => "int32",
            ValueKind::I64 => "int64",
            ValueKind::Ascii => "ascii",
            ValueKind::Hex => "hex",
            ValueKind::Raw => "raw",
        }
    }

    /// Parses a command-line style value for this kind.
    ///
    /// Integers accept decimal or `0x` hex; raw values are hex strings.
    pub fn parse_value(self, input: &str) -> Result<Value, ProtocolError> {
        match self {
            ValueKind::U8 | ValueKind::U16 | ValueKind::U32 | ValueKind::U64 => {
                parse_unsigned(input).map(Value::Unsigned)
            }
            ValueKind::I8 | ValueKind::I16 | ValueKind::I32 | ValueKind::I64 => input
                .parse::<i64>()
                .map(Value::Signed)
                .map_err(|_| ProtocolError::InvalidValue(format!("{:?} is not an integer", input))),
            ValueKind::Ascii | ValueKind::Hex => Ok(Value::Text(input.to_string())),
            ValueKind::Raw => Ok(Value::Bytes(Bytes::from(hex::decode(input)?))),
        }
    }
}

impl FromStr for ValueKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uint8" | "u8" => Ok(ValueKind::U8),
            "uint16" | "u16" => Ok(ValueKind::U16),
            "uint32" | "u32" => Ok(ValueKind::U32),
            "uint64" | "u64" => Ok(ValueKind::U64),
            "int8" | "i8" => Ok(ValueKind::I8),
            "int16" | "i16" => Ok(ValueKind::I16),
            "int32" | "i32" => Ok(ValueKind::I32),
            "int64" | "i64" => Ok(ValueKind::I64),
            "ascii" => Ok(ValueKind::Ascii),
            "hex" => Ok(ValueKind::Hex),
            "raw" | "bytes" => Ok(ValueKind::Raw),
            _ => Err(ProtocolError::UnknownValueKind(s.to_string())),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A dynamically typed ERD value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Text(String),
    Bytes(Bytes),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Signed(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "{}", hex::encode(v)),
        }
    }
}

/// Parses an unsigned integer written in decimal or with a `0x` prefix.
pub fn parse_unsigned(input: &str) -> Result<u64, ProtocolError> {
    let trimmed = input.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(digits) => u64::from_str_radix(digits, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|_| {
        ProtocolError::InvalidValue(format!("{:?} is not an unsigned integer", input))
    })
}

/// Serializer whose encoding is chosen at runtime.
#[derive(Debug, Clone, Copy)]
pub struct DynamicSerializer {
    kind: ValueKind,
    endian: Endian,
}

impl DynamicSerializer {
    pub fn new(kind: ValueKind, endian: Endian) -> Self {
        Self { kind, endian }
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    fn integer<T>(&self, value: &Value) -> Result<T, ProtocolError>
    where
        T: Scalar + TryFrom<u64> + TryFrom<i64>,
    {
        let converted = match value {
            Value::Unsigned(v) => <T as TryFrom<u64>>::try_from(*v).ok(),
            Value::Signed(v) => <T as TryFrom<i64>>::try_from(*v).ok(),
            _ => None,
        };
        converted.ok_or_else(|| {
            ProtocolError::InvalidValue(format!("{} does not fit {}", value, self.kind))
        })
    }

    fn scalar<T: Scalar>(&self, value: T) -> Bytes {
        let mut writer = StreamWriter::new(T::SIZE, self.endian);
        value.write(&mut writer);
        writer.freeze()
    }

    fn read<T: Scalar>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        check_length(T::SIZE, data)?;
        Ok(T::read(&mut StreamReader::new(data, self.endian)))
    }
}

impl Serializer for DynamicSerializer {
    type Value = Value;

    fn serialize(&self, value: &Value) -> Result<Bytes, ProtocolError> {
        match (self.kind, value) {
            (ValueKind::U8, _) => Ok(self.scalar(self.integer::<u8>(value)?)),
            (ValueKind::U16, _) => Ok(self.scalar(self.integer::<u16>(value)?)),
            (ValueKind::U32, _) => Ok(self.scalar(self.integer::<u32>(value)?)),
            (ValueKind::U64, _) => Ok(self.scalar(self.integer::<u64>(value)?)),
            (ValueKind::I8, _) => Ok(self.scalar(self.integer::<i8>(value)?)),
            (ValueKind::I16, _) => Ok(self.scalar(self.integer::<i16>(value)?)),
            (ValueKind::I32, _) => Ok(self.scalar(self.integer::<i32>(value)?)),
            (ValueKind::I64, _) => Ok(self.scalar(self.integer::<i64>(value)?)),
            (ValueKind::Ascii, Value::Text(text)) => AsciiSerializer.serialize(text),
            (ValueKind::Hex, Value::Text(text)) => HexSerializer.serialize(text),
            (ValueKind::Raw, Value::Bytes(bytes)) => Ok(bytes.clone()),
            (kind, value) => Err(ProtocolError::InvalidValue(format!(
                "{:?} cannot be encoded as {}",
                value, kind
            ))),
        }
    }

    fn deserialize(&self, data: &[u8]) -> Result<Value, ProtocolError> {
        Ok(match self.kind {
            ValueKind::U8 => Value::Unsigned(self.read::<u8>(data)?.into()),
            ValueKind::U16 => Value::Unsigned(self.read::<u16>(data)?.into()),
            ValueKind::U32 => Value::Unsigned(self.read::<u32>(data)?.into()),
            ValueKind::U64 => Value::Unsigned(self.read::<u64>(data)?),
            ValueKind::I8 => Value::Signed(self.read::<i8>(data)?.into()),
            ValueKind::I16 => Value::Signed(self.read::<i16>(data)?.into()),
            ValueKind::I32 => Value::Signed(self.read::<i32>(data)?.into()),
            ValueKind::I64 => Value::Signed(self.read::<i64>(data)?),
            ValueKind::Ascii => Value::Text(AsciiSerializer.deserialize(data)?),
            ValueKind::Hex => Value::Text(HexSerializer.deserialize(data)?),
            ValueKind::Raw => Value::Bytes(Bytes::copy_from_slice(data)),
        })
    }
}
