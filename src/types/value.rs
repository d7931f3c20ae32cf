//! # Runtime Values
//!
//! [`Value`] is the owned runtime representation of a single cell. Records
//! outlive the page pins they were read from, so values own their payloads
//! (strings and vectors are heap-allocated; scalars are inline).
//!
//! ## Comparison semantics
//!
//! - Numeric kinds compare after promotion to `f64` when widths differ.
//! - Strings compare lexically, dates by instant, booleans false < true.
//! - Vectors do not order; `compare` returns `None` for them.
//!
//! `NULL` is not a `Value`: nullable cells travel as `Option<Value>`.

use super::Type;
use eyre::{bail, ensure, Result};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Date(i64),
    String(String),
    Complex32([f32; 2]),
    Complex64([f64; 2]),
    BooleanVector(Vec<bool>),
    IntVector(Vec<i32>),
    LongVector(Vec<i64>),
    FloatVector(Vec<f32>),
    DoubleVector(Vec<f64>),
    Complex32Vector(Vec<[f32; 2]>),
    Complex64Vector(Vec<[f64; 2]>),
}

impl Value {
    pub fn type_of(&self) -> Type {
        match self {
            Value::Boolean(_) => Type::Boolean,
            Value::Byte(_) => Type::Byte,
            Value::Short(_) => Type::Short,
            Value::Int(_) => Type::Int,
            Value::Long(_) => Type::Long,
            Value::Float(_) => Type::Float,
            Value::Double(_) => Type::Double,
            Value::Date(_) => Type::Date,
            Value::String(_) => Type::String,
            Value::Complex32(_) => Type::Complex32,
            Value::Complex64(_) => Type::Complex64,
            Value::BooleanVector(v) => Type::BooleanVector(v.len() as u32),
            Value::IntVector(v) => Type::IntVector(v.len() as u32),
            Value::LongVector(v) => Type::LongVector(v.len() as u32),
            Value::FloatVector(v) => Type::FloatVector(v.len() as u32),
            Value::DoubleVector(v) => Type::DoubleVector(v.len() as u32),
            Value::Complex32Vector(v) => Type::Complex32Vector(v.len() as u32),
            Value::Complex64Vector(v) => Type::Complex64Vector(v.len() as u32),
        }
    }

    /// Promotes numeric scalars to `f64`; `None` for everything else.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Byte(v) => Some(*v as f64),
            Value::Short(v) => Some(*v as f64),
            Value::Int(v) => Some(*v as f64),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Contiguous f32 view for the SIMD distance kernels.
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        match self {
            Value::FloatVector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64_slice(&self) -> Option<&[f64]> {
        match self {
            Value::DoubleVector(v) => Some(v),
            _ => None,
        }
    }

    /// Total order used by predicates; `None` where no order exists.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                Some(a.total_cmp(&b))
            }
        }
    }

    /// Writes a fixed-width payload. `buf` must be exactly
    /// `type_of().physical_size()` bytes.
    pub fn write_fixed(&self, buf: &mut [u8]) -> Result<()> {
        let size = self
            .type_of()
            .physical_size()
            .ok_or_else(|| eyre::eyre!("{} has no fixed payload", self.type_of().name()))?;
        ensure!(
            buf.len() == size,
            "payload buffer mismatch: {} != {}",
            buf.len(),
            size
        );
        match self {
            Value::Boolean(v) => buf[0] = *v as u8,
            Value::Byte(v) => buf[0] = *v as u8,
            Value::Short(v) => buf.copy_from_slice(&v.to_le_bytes()),
            Value::Int(v) => buf.copy_from_slice(&v.to_le_bytes()),
            Value::Long(v) | Value::Date(v) => buf.copy_from_slice(&v.to_le_bytes()),
            Value::Float(v) => buf.copy_from_slice(&v.to_le_bytes()),
            Value::Double(v) => buf.copy_from_slice(&v.to_le_bytes()),
            Value::Complex32(c) => {
                buf[..4].copy_from_slice(&c[0].to_le_bytes());
                buf[4..].copy_from_slice(&c[1].to_le_bytes());
            }
            Value::Complex64(c) => {
                buf[..8].copy_from_slice(&c[0].to_le_bytes());
                buf[8..].copy_from_slice(&c[1].to_le_bytes());
            }
            Value::BooleanVector(v) => {
                for (slot, b) in buf.iter_mut().zip(v.iter()) {
                    *slot = *b as u8;
                }
            }
            Value::IntVector(v) => {
                for (chunk, e) in buf.chunks_exact_mut(4).zip(v.iter()) {
                    chunk.copy_from_slice(&e.to_le_bytes());
                }
            }
            Value::LongVector(v) => {
                for (chunk, e) in buf.chunks_exact_mut(8).zip(v.iter()) {
                    chunk.copy_from_slice(&e.to_le_bytes());
                }
            }
            Value::FloatVector(v) => {
                for (chunk, e) in buf.chunks_exact_mut(4).zip(v.iter()) {
                    chunk.copy_from_slice(&e.to_le_bytes());
                }
            }
            Value::DoubleVector(v) => {
                for (chunk, e) in buf.chunks_exact_mut(8).zip(v.iter()) {
                    chunk.copy_from_slice(&e.to_le_bytes());
                }
            }
            Value::Complex32Vector(v) => {
                for (chunk, c) in buf.chunks_exact_mut(8).zip(v.iter()) {
                    chunk[..4].copy_from_slice(&c[0].to_le_bytes());
                    chunk[4..].copy_from_slice(&c[1].to_le_bytes());
                }
            }
            Value::Complex64Vector(v) => {
                for (chunk, c) in buf.chunks_exact_mut(16).zip(v.iter()) {
                    chunk[..8].copy_from_slice(&c[0].to_le_bytes());
                    chunk[8..].copy_from_slice(&c[1].to_le_bytes());
                }
            }
            Value::String(_) => unreachable!("string has no fixed payload"),
        }
        Ok(())
    }

    /// Reads a fixed-width payload written by [`Value::write_fixed`].
    pub fn read_fixed(ty: Type, buf: &[u8]) -> Result<Value> {
        let size = ty
            .physical_size()
            .ok_or_else(|| eyre::eyre!("{} has no fixed payload", ty.name()))?;
        ensure!(
            buf.len() == size,
            "payload buffer mismatch: {} != {}",
            buf.len(),
            size
        );
        let le4 = |b: &[u8]| -> [u8; 4] { [b[0], b[1], b[2], b[3]] };
        let le8 = |b: &[u8]| -> [u8; 8] { [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]] };
        Ok(match ty {
            Type::Boolean => Value::Boolean(buf[0] != 0),
            Type::Byte => Value::Byte(buf[0] as i8),
            Type::Short => Value::Short(i16::from_le_bytes([buf[0], buf[1]])),
            Type::Int => Value::Int(i32::from_le_bytes(le4(buf))),
            Type::Long => Value::Long(i64::from_le_bytes(le8(buf))),
            Type::Float => Value::Float(f32::from_le_bytes(le4(buf))),
            Type::Double => Value::Double(f64::from_le_bytes(le8(buf))),
            Type::Date => Value::Date(i64::from_le_bytes(le8(buf))),
            Type::Complex32 => Value::Complex32([
                f32::from_le_bytes(le4(&buf[..4])),
                f32::from_le_bytes(le4(&buf[4..])),
            ]),
            Type::Complex64 => Value::Complex64([
                f64::from_le_bytes(le8(&buf[..8])),
                f64::from_le_bytes(le8(&buf[8..])),
            ]),
            Type::BooleanVector(_) => Value::BooleanVector(buf.iter().map(|b| *b != 0).collect()),
            Type::IntVector(_) => Value::IntVector(
                buf.chunks_exact(4)
                    .map(|c| i32::from_le_bytes(le4(c)))
                    .collect(),
            ),
            Type::LongVector(_) => Value::LongVector(
                buf.chunks_exact(8)
                    .map(|c| i64::from_le_bytes(le8(c)))
                    .collect(),
            ),
            Type::FloatVector(_) => Value::FloatVector(
                buf.chunks_exact(4)
                    .map(|c| f32::from_le_bytes(le4(c)))
                    .collect(),
            ),
            Type::DoubleVector(_) => Value::DoubleVector(
                buf.chunks_exact(8)
                    .map(|c| f64::from_le_bytes(le8(c)))
                    .collect(),
            ),
            Type::Complex32Vector(_) => Value::Complex32Vector(
                buf.chunks_exact(8)
                    .map(|c| {
                        [
                            f32::from_le_bytes(le4(&c[..4])),
                            f32::from_le_bytes(le4(&c[4..])),
                        ]
                    })
                    .collect(),
            ),
            Type::Complex64Vector(_) => Value::Complex64Vector(
                buf.chunks_exact(16)
                    .map(|c| {
                        [
                            f64::from_le_bytes(le8(&c[..8])),
                            f64::from_le_bytes(le8(&c[8..])),
                        ]
                    })
                    .collect(),
            ),
            Type::String => unreachable!("string has no fixed payload"),
        })
    }

    /// Variable-width payload bytes (strings only).
    pub fn write_variable(&self) -> Result<Vec<u8>> {
        match self {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            other => bail!("{} is not a variable-width value", other.type_of().name()),
        }
    }

    pub fn read_variable(ty: Type, buf: &[u8]) -> Result<Value> {
        match ty {
            Type::String => Ok(Value::String(
                std::str::from_utf8(buf)
                    .map_err(|e| eyre::eyre!("invalid utf-8 in string payload: {}", e))?
                    .to_string(),
            )),
            other => bail!("{} is not a variable-width type", other.name()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Byte(v) => write!(f, "{}", v),
            Value::Short(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "date({})", v),
            Value::String(v) => write!(f, "{}", v),
            Value::Complex32(c) => write!(f, "{}+{}i", c[0], c[1]),
            Value::Complex64(c) => write!(f, "{}+{}i", c[0], c[1]),
            other => write!(f, "{}[{}]", other.type_of().name(), other.type_of().logical_size()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_roundtrip_scalars() {
        let values = [
            Value::Boolean(true),
            Value::Byte(-3),
            Value::Short(1234),
            Value::Int(-77),
            Value::Long(1 << 40),
            Value::Float(0.25),
            Value::Double(-1e9),
            Value::Date(1_700_000_000_000),
            Value::Complex32([1.0, -2.0]),
            Value::Complex64([3.0, 4.5]),
        ];
        for v in values {
            let size = v.type_of().physical_size().unwrap();
            let mut buf = vec![0u8; size];
            v.write_fixed(&mut buf).unwrap();
            let back = Value::read_fixed(v.type_of(), &buf).unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn fixed_roundtrip_vectors() {
        let v = Value::FloatVector(vec![1.0, 0.0, -0.5, 3.25]);
        let mut buf = vec![0u8; 16];
        v.write_fixed(&mut buf).unwrap();
        assert_eq!(Value::read_fixed(Type::FloatVector(4), &buf).unwrap(), v);

        let v = Value::LongVector(vec![i64::MIN, 0, i64::MAX]);
        let mut buf = vec![0u8; 24];
        v.write_fixed(&mut buf).unwrap();
        assert_eq!(Value::read_fixed(Type::LongVector(3), &buf).unwrap(), v);
    }

    #[test]
    fn numeric_promotion_in_compare() {
        assert_eq!(
            Value::Int(2).compare(&Value::Double(2.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::Long(3).compare(&Value::Float(2.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::String("a".into()).compare(&Value::Int(1)), None);
    }

    #[test]
    fn string_variable_roundtrip() {
        let v = Value::String("lepus europaeus".into());
        let bytes = v.write_variable().unwrap();
        assert_eq!(Value::read_variable(Type::String, &bytes).unwrap(), v);
    }

    #[test]
    fn wrong_buffer_size_rejected() {
        let mut buf = [0u8; 3];
        assert!(Value::Int(1).write_fixed(&mut buf).is_err());
    }
}
