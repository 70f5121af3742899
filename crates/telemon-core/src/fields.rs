//! Field layout descriptions for telemetry records.
//!
//! A [`FieldOffsetTable`] maps field names to fixed byte offsets relative to
//! a resolved base address. All raw fields are 4-byte little-endian scalars;
//! [`DerivedField`]s describe pure post-processing (unit conversion, bitfield
//! decomposition) applied to the raw values before a record is emitted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::Display;

/// Scalar type of a raw field read from target memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScalarType {
    Uint32,
    Int32,
    Float32,
}

impl ScalarType {
    /// All supported scalars are 4 bytes wide.
    pub const SIZE: usize = 4;

    /// Decode a little-endian 4-byte span into a typed value.
    pub fn decode(self, bytes: [u8; 4]) -> ScalarValue {
        match self {
            ScalarType::Uint32 => ScalarValue::U32(u32::from_le_bytes(bytes)),
            ScalarType::Int32 => ScalarValue::I32(i32::from_le_bytes(bytes)),
            ScalarType::Float32 => ScalarValue::F32(f32::from_le_bytes(bytes)),
        }
    }
}

/// A typed scalar read from target memory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    U32(u32),
    I32(i32),
    F32(f32),
}

impl ScalarValue {
    pub fn as_f64(self) -> f64 {
        match self {
            ScalarValue::U32(v) => v as f64,
            ScalarValue::I32(v) => v as f64,
            ScalarValue::F32(v) => v as f64,
        }
    }

    /// Raw 32-bit representation, used by bitfield decomposition.
    pub fn as_bits(self) -> u32 {
        match self {
            ScalarValue::U32(v) => v,
            ScalarValue::I32(v) => v as u32,
            ScalarValue::F32(v) => v.to_bits(),
        }
    }
}

/// A value in an emitted telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    U32(u32),
    I32(i32),
    F32(f32),
}

impl From<ScalarValue> for FieldValue {
    fn from(value: ScalarValue) -> Self {
        match value {
            ScalarValue::U32(v) => FieldValue::U32(v),
            ScalarValue::I32(v) => FieldValue::I32(v),
            ScalarValue::F32(v) => FieldValue::F32(v),
        }
    }
}

/// Offset and type of one raw field, relative to the base address.
///
/// Serialized as `[offset, "uint32"]` to keep offset tables compact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldDef(pub u64, pub ScalarType);

impl FieldDef {
    pub fn offset(&self) -> u64 {
        self.0
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.1
    }
}

/// Field name to `(offset, type)` table for one telemetry kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldOffsetTable(pub BTreeMap<String, FieldDef>);

impl FieldOffsetTable {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, name: &str) -> Option<&FieldDef> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldDef)> {
        self.0.iter()
    }
}

/// Pure transformation applied to one raw field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldOp {
    /// `raw * factor + offset`, emitted as float32.
    Linear {
        factor: f64,
        #[serde(default)]
        offset: f64,
    },
    /// `(bits >> shift) & mask`, emitted as uint32.
    Bits { shift: u32, mask: u32 },
    /// `bits & mask != 0`, emitted as bool.
    Flag { mask: u32 },
}

impl FieldOp {
    pub fn apply(&self, raw: ScalarValue) -> FieldValue {
        match *self {
            FieldOp::Linear { factor, offset } => {
                FieldValue::F32((raw.as_f64() * factor + offset) as f32)
            }
            FieldOp::Bits { shift, mask } => FieldValue::U32((raw.as_bits() >> shift) & mask),
            FieldOp::Flag { mask } => FieldValue::Bool(raw.as_bits() & mask != 0),
        }
    }
}

/// A derived record field computed from a raw field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedField {
    pub name: String,
    pub source: String,
    #[serde(flatten)]
    pub op: FieldOp,
}

impl DerivedField {
    /// Compute the derived value from the raw field map. Returns `None` when
    /// the source field is absent.
    pub fn apply(&self, raw: &BTreeMap<String, ScalarValue>) -> Option<FieldValue> {
        raw.get(self.source.as_str()).map(|v| self.op.apply(*v))
    }
}
