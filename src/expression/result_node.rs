// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{
    decode_bytes, decode_string, encode_bytes, encode_string, Decode, DecodeError, Encode,
    EncodeError,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::io::{Read, Write};
use xxhash_rust::xxh3::Xxh3;

const CLASS_INTEGER: u32 = 1;
const CLASS_FLOAT: u32 = 2;
const CLASS_STRING: u32 = 3;
const CLASS_RAW: u32 = 4;
const CLASS_BOOL: u32 = 5;
const CLASS_ENUM: u32 = 6;

const CLASS_INTEGER_VEC: u32 = 17;
const CLASS_FLOAT_VEC: u32 = 18;
const CLASS_STRING_VEC: u32 = 19;
const CLASS_RAW_VEC: u32 = 20;
const CLASS_BOOL_VEC: u32 = 21;
const CLASS_ENUM_VEC: u32 = 22;

// Maximal sentinel values for set_max on non-numeric kinds. Any realistic
// key sorts below these.
const MAX_STRING: &str = "\u{10FFFF}\u{10FFFF}\u{10FFFF}\u{10FFFF}";
const MAX_RAW: [u8; 16] = [0xff; 16];

/// A lazy sequence of same-kind scalar values.
#[derive(Clone, Debug, PartialEq)]
pub enum ResultNodeVector {
    Integer(Vec<i64>),
    Float(Vec<f64>),
    String(Vec<String>),
    Raw(Vec<Vec<u8>>),
    Bool(Vec<bool>),
    Enum(Vec<u64>),
}

impl ResultNodeVector {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Integer(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::String(v) => v.len(),
            Self::Raw(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::Enum(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materializes element `i` as a scalar node.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<ResultNode> {
        match self {
            Self::Integer(v) => v.get(i).map(|x| ResultNode::Integer(*x)),
            Self::Float(v) => v.get(i).map(|x| ResultNode::Float(*x)),
            Self::String(v) => v.get(i).map(|x| ResultNode::String(x.clone())),
            Self::Raw(v) => v.get(i).map(|x| ResultNode::Raw(x.clone())),
            Self::Bool(v) => v.get(i).map(|x| ResultNode::Bool(*x)),
            Self::Enum(v) => v.get(i).map(|x| ResultNode::Enum(*x)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ResultNode> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    pub fn flatten_sum(&self, target: &mut ResultNode) {
        for v in self.iter() {
            target.add(&v);
        }
    }

    pub fn flatten_min(&self, target: &mut ResultNode) {
        for v in self.iter() {
            target.min_op(&v);
        }
    }

    pub fn flatten_max(&self, target: &mut ResultNode) {
        for v in self.iter() {
            target.max_op(&v);
        }
    }

    pub fn flatten_sum_of_squares(&self, target: &mut f64) {
        for v in self.iter() {
            let f = v.as_float();
            *target += f * f;
        }
    }
}

/// A tagged sum over the scalar kinds of the engine plus vectors of each.
///
/// Replaces the original on-wire class registry: every variant carries a
/// stable class id so serialized values stay byte-compatible.
#[derive(Clone, Debug)]
pub enum ResultNode {
    Integer(i64),
    Float(f64),
    String(String),
    Raw(Vec<u8>),
    Bool(bool),
    Enum(u64),
    Vector(ResultNodeVector),
}

impl Default for ResultNode {
    fn default() -> Self {
        Self::Integer(0)
    }
}

impl ResultNode {
    #[must_use]
    pub fn class_id(&self) -> u32 {
        match self {
            Self::Integer(_) => CLASS_INTEGER,
            Self::Float(_) => CLASS_FLOAT,
            Self::String(_) => CLASS_STRING,
            Self::Raw(_) => CLASS_RAW,
            Self::Bool(_) => CLASS_BOOL,
            Self::Enum(_) => CLASS_ENUM,
            Self::Vector(v) => match v {
                ResultNodeVector::Integer(_) => CLASS_INTEGER_VEC,
                ResultNodeVector::Float(_) => CLASS_FLOAT_VEC,
                ResultNodeVector::String(_) => CLASS_STRING_VEC,
                ResultNodeVector::Raw(_) => CLASS_RAW_VEC,
                ResultNodeVector::Bool(_) => CLASS_BOOL_VEC,
                ResultNodeVector::Enum(_) => CLASS_ENUM_VEC,
            },
        }
    }

    #[must_use]
    pub fn is_multi_value(&self) -> bool {
        matches!(self, Self::Vector(_))
    }

    #[must_use]
    pub fn is_integer_kind(&self) -> bool {
        matches!(self, Self::Integer(_) | Self::Bool(_) | Self::Enum(_))
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Integer(_) | Self::Float(_) | Self::Bool(_) | Self::Enum(_)
        )
    }

    /// A fresh zero value of the same kind, used as the accumulator
    /// prototype once the first sample fixes the numeric width.
    #[must_use]
    pub fn create_base_type(&self) -> Self {
        match self {
            Self::Integer(_) | Self::Bool(_) | Self::Enum(_) => Self::Integer(0),
            Self::Float(_) => Self::Float(0.0),
            Self::String(_) => Self::String(String::new()),
            Self::Raw(_) => Self::Raw(Vec::new()),
            Self::Vector(v) => match v {
                ResultNodeVector::Float(_) => Self::Float(0.0),
                ResultNodeVector::String(_) => Self::String(String::new()),
                ResultNodeVector::Raw(_) => Self::Raw(Vec::new()),
                _ => Self::Integer(0),
            },
        }
    }

    #[must_use]
    pub fn as_float(&self) -> f64 {
        match self {
            // NOTE: Precision loss is inherent to float accumulation
            #[allow(clippy::cast_precision_loss)]
            Self::Integer(v) => *v as f64,
            Self::Float(v) => *v,
            Self::Bool(v) => f64::from(u8::from(*v)),
            #[allow(clippy::cast_precision_loss)]
            Self::Enum(v) => *v as f64,
            _ => 0.0,
        }
    }

    #[must_use]
    pub fn as_integer(&self) -> i64 {
        match self {
            Self::Integer(v) => *v,
            // NOTE: Saturating cast is the wanted behavior
            #[allow(clippy::cast_possible_truncation)]
            Self::Float(v) => *v as i64,
            Self::Bool(v) => i64::from(*v),
            // NOTE: Enum ids fit in i64 in practice
            #[allow(clippy::cast_possible_wrap)]
            Self::Enum(v) => *v as i64,
            _ => 0,
        }
    }

    /// Stable 64-bit hash over kind and canonical value bytes.
    #[must_use]
    pub fn hash(&self) -> u64 {
        let mut hasher = Xxh3::new();
        self.hash_into(&mut hasher);
        hasher.digest()
    }

    fn hash_into(&self, hasher: &mut Xxh3) {
        hasher.update(&self.class_id().to_be_bytes());
        match self {
            Self::Integer(v) => hasher.update(&v.to_be_bytes()),
            Self::Float(v) => hasher.update(&v.to_bits().to_be_bytes()),
            Self::String(v) => hasher.update(v.as_bytes()),
            Self::Raw(v) => hasher.update(v),
            Self::Bool(v) => hasher.update(&[u8::from(*v)]),
            Self::Enum(v) => hasher.update(&v.to_be_bytes()),
            Self::Vector(vec) => {
                for v in vec.iter() {
                    v.hash_into(hasher);
                }
            }
        }
    }

    /// Total order: kind first, then value (floats via total order).
    #[must_use]
    pub fn cmp_value(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Raw(a), Self::Raw(b)) => a.cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Enum(a), Self::Enum(b)) => a.cmp(b),
            (a, b) if a.is_numeric() && b.is_numeric() => a.as_float().total_cmp(&b.as_float()),
            (a, b) => a.class_id().cmp(&b.class_id()),
        }
    }

    pub fn add(&mut self, other: &Self) {
        match self {
            Self::Integer(v) => *v = v.wrapping_add(other.as_integer()),
            Self::Float(v) => *v += other.as_float(),
            _ => {}
        }
    }

    pub fn min_op(&mut self, other: &Self) {
        if self.cmp_sameness(other) == Ordering::Greater {
            self.set(other);
        }
    }

    pub fn max_op(&mut self, other: &Self) {
        if self.cmp_sameness(other) == Ordering::Less {
            self.set(other);
        }
    }

    // Comparison used by min/max where numeric kinds compare by value
    // regardless of width.
    fn cmp_sameness(&self, other: &Self) -> Ordering {
        if self.is_numeric() && other.is_numeric() {
            if self.is_integer_kind() && other.is_integer_kind() {
                self.as_integer().cmp(&other.as_integer())
            } else {
                self.as_float().total_cmp(&other.as_float())
            }
        } else {
            self.cmp_value(other)
        }
    }

    /// Folds `other` into an integer accumulator with xor. Integer kinds
    /// contribute their value, floats their bit pattern, everything else
    /// its hash.
    pub fn xor_op(&mut self, other: &Self) {
        let rhs = match other {
            Self::Integer(_) | Self::Bool(_) | Self::Enum(_) => other.as_integer(),
            // NOTE: Bit pattern keeps xor exact for floats
            #[allow(clippy::cast_possible_wrap)]
            Self::Float(v) => v.to_bits() as i64,
            #[allow(clippy::cast_possible_wrap)]
            _ => other.hash() as i64,
        };
        if let Self::Integer(v) = self {
            *v ^= rhs;
        }
    }

    /// Integer accumulators divide with integer semantics.
    pub fn divide(&mut self, by: u64) {
        if by == 0 {
            *self = self.create_base_type();
            return;
        }
        match self {
            // NOTE: counts fit in i64
            #[allow(clippy::cast_possible_wrap)]
            Self::Integer(v) => *v /= by as i64,
            #[allow(clippy::cast_precision_loss)]
            Self::Float(v) => *v /= by as f64,
            _ => {}
        }
    }

    /// Overwrites the value, keeping the receiver's kind when both sides
    /// are numeric.
    pub fn set(&mut self, other: &Self) {
        match (&mut *self, other) {
            (Self::Integer(v), rhs) if rhs.is_numeric() => *v = rhs.as_integer(),
            (Self::Float(v), rhs) if rhs.is_numeric() => *v = rhs.as_float(),
            (lhs, rhs) => *lhs = rhs.clone(),
        }
    }

    pub fn set_min(&mut self) {
        match self {
            Self::Integer(v) => *v = i64::MIN,
            Self::Float(v) => *v = f64::MIN,
            Self::String(v) => v.clear(),
            Self::Raw(v) => v.clear(),
            Self::Bool(v) => *v = false,
            Self::Enum(v) => *v = u64::MIN,
            Self::Vector(_) => {}
        }
    }

    pub fn set_max(&mut self) {
        match self {
            Self::Integer(v) => *v = i64::MAX,
            Self::Float(v) => *v = f64::MAX,
            Self::String(v) => *v = MAX_STRING.into(),
            Self::Raw(v) => *v = MAX_RAW.to_vec(),
            Self::Bool(v) => *v = true,
            Self::Enum(v) => *v = u64::MAX,
            Self::Vector(_) => {}
        }
    }
}

impl PartialEq for ResultNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_value(other) == Ordering::Equal && self.class_id() == other.class_id()
    }
}

impl Eq for ResultNode {}

impl PartialOrd for ResultNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResultNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_value(other)
            .then_with(|| self.class_id().cmp(&other.class_id()))
    }
}

impl std::hash::Hash for ResultNode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash());
    }
}

impl Encode for ResultNode {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.class_id())?;
        match self {
            Self::Integer(v) => writer.write_i64::<BigEndian>(*v)?,
            Self::Float(v) => writer.write_u64::<BigEndian>(v.to_bits())?,
            Self::String(v) => encode_string(writer, v)?,
            Self::Raw(v) => encode_bytes(writer, v)?,
            Self::Bool(v) => writer.write_u8(u8::from(*v))?,
            Self::Enum(v) => writer.write_u64::<BigEndian>(*v)?,
            Self::Vector(vec) => {
                // NOTE: Truncation is OK, vectors are bounded by document size
                #[allow(clippy::cast_possible_truncation)]
                writer.write_u32::<BigEndian>(vec.len() as u32)?;
                match vec {
                    ResultNodeVector::Integer(v) => {
                        for x in v {
                            writer.write_i64::<BigEndian>(*x)?;
                        }
                    }
                    ResultNodeVector::Float(v) => {
                        for x in v {
                            writer.write_u64::<BigEndian>(x.to_bits())?;
                        }
                    }
                    ResultNodeVector::String(v) => {
                        for x in v {
                            encode_string(writer, x)?;
                        }
                    }
                    ResultNodeVector::Raw(v) => {
                        for x in v {
                            encode_bytes(writer, x)?;
                        }
                    }
                    ResultNodeVector::Bool(v) => {
                        for x in v {
                            writer.write_u8(u8::from(*x))?;
                        }
                    }
                    ResultNodeVector::Enum(v) => {
                        for x in v {
                            writer.write_u64::<BigEndian>(*x)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Decode for ResultNode {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let class_id = reader.read_u32::<BigEndian>()?;
        Self::decode_payload(class_id, reader)
    }
}

impl ResultNode {
    /// Decodes the payload of an already-consumed class id.
    pub(crate) fn decode_payload<R: Read>(
        class_id: u32,
        reader: &mut R,
    ) -> Result<Self, DecodeError> {
        match class_id {
            CLASS_INTEGER => Ok(Self::Integer(reader.read_i64::<BigEndian>()?)),
            CLASS_FLOAT => Ok(Self::Float(f64::from_bits(reader.read_u64::<BigEndian>()?))),
            CLASS_STRING => Ok(Self::String(decode_string(reader)?)),
            CLASS_RAW => Ok(Self::Raw(decode_bytes(reader)?)),
            CLASS_BOOL => Ok(Self::Bool(reader.read_u8()? != 0)),
            CLASS_ENUM => Ok(Self::Enum(reader.read_u64::<BigEndian>()?)),
            CLASS_INTEGER_VEC | CLASS_FLOAT_VEC | CLASS_STRING_VEC | CLASS_RAW_VEC
            | CLASS_BOOL_VEC | CLASS_ENUM_VEC => {
                let count = reader.read_u32::<BigEndian>()? as usize;
                let vec = match class_id {
                    CLASS_INTEGER_VEC => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(reader.read_i64::<BigEndian>()?);
                        }
                        ResultNodeVector::Integer(v)
                    }
                    CLASS_FLOAT_VEC => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(f64::from_bits(reader.read_u64::<BigEndian>()?));
                        }
                        ResultNodeVector::Float(v)
                    }
                    CLASS_STRING_VEC => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(decode_string(reader)?);
                        }
                        ResultNodeVector::String(v)
                    }
                    CLASS_RAW_VEC => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(decode_bytes(reader)?);
                        }
                        ResultNodeVector::Raw(v)
                    }
                    CLASS_BOOL_VEC => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(reader.read_u8()? != 0);
                        }
                        ResultNodeVector::Bool(v)
                    }
                    _ => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(reader.read_u64::<BigEndian>()?);
                        }
                        ResultNodeVector::Enum(v)
                    }
                };
                Ok(Self::Vector(vec))
            }
            tag => Err(DecodeError::InvalidTag(("ResultNode", tag))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn serde_roundtrip_all_kinds() -> Result<(), DecodeError> {
        let values = [
            ResultNode::Integer(-42),
            ResultNode::Float(13.25),
            ResultNode::String("group".into()),
            ResultNode::Raw(vec![0, 1, 2, 0xff]),
            ResultNode::Bool(true),
            ResultNode::Enum(99),
            ResultNode::Vector(ResultNodeVector::Integer(vec![1, 2, 3])),
            ResultNode::Vector(ResultNodeVector::String(vec!["a".into(), "b".into()])),
        ];

        for value in values {
            let bytes = value.encode_into_vec();
            let decoded = ResultNode::decode_from(&mut &bytes[..])?;
            assert_eq!(value, decoded);
        }
        Ok(())
    }

    #[test]
    fn min_max_track_extremes() {
        let mut min = ResultNode::Integer(0);
        min.set_max();
        for v in [5i64, -3, 12] {
            min.min_op(&ResultNode::Integer(v));
        }
        assert_eq!(ResultNode::Integer(-3), min);

        let mut max = ResultNode::Float(0.0);
        max.set_min();
        for v in [0.5, 9.75, -2.0] {
            max.max_op(&ResultNode::Float(v));
        }
        assert_eq!(ResultNode::Float(9.75), max);
    }

    #[test]
    fn integer_average_divides_with_integer_semantics() {
        let mut sum = ResultNode::Integer(7);
        sum.divide(2);
        assert_eq!(ResultNode::Integer(3), sum);
    }

    #[test]
    fn hash_is_stable_per_value() {
        let a = ResultNode::String("red".into());
        let b = ResultNode::String("red".into());
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), ResultNode::String("blue".into()).hash());
    }
}
