//! Typed, introspectable session properties.
//!
//! Every session kind recognises a closed set of [`PropertyKey`]s. Each
//! recognised key carries a [`PropertySpec`] describing its value type,
//! access mode, default and valid range. Unknown keys are rejected, never
//! silently stored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{CodingError, CodingResult};
use crate::storage::MultiPassStore;

/// Recognised property keys.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PropertyKey {
    /// Frames submitted but not yet delivered (read-only).
    NumberOfPendingFrames,
    /// Whether caller and codec share one buffer pool (read-only).
    PixelBufferPoolIsShared,
    RealTime,
    /// Target bit rate in bits per second. 0 disables rate control.
    AverageBitRate,
    /// 0.0 (smallest output) to 1.0 (lossless).
    Quality,
    MaxKeyFrameInterval,
    ExpectedFrameRate,
    ProfileLevel,
    /// Attached multi-pass storage. Setting it enables multi-pass mode.
    MultiPassStorage,
    EncoderId,
    DecoderId,
    /// Frames a decompression session holds back to restore display order.
    TemporalReorderDepth,
    OutputPoolMinimumBufferCount,
}

impl PropertyKey {
    pub const ALL: [PropertyKey; 13] = [
        Self::NumberOfPendingFrames,
        Self::PixelBufferPoolIsShared,
        Self::RealTime,
        Self::AverageBitRate,
        Self::Quality,
        Self::MaxKeyFrameInterval,
        Self::ExpectedFrameRate,
        Self::ProfileLevel,
        Self::MultiPassStorage,
        Self::EncoderId,
        Self::DecoderId,
        Self::TemporalReorderDepth,
        Self::OutputPoolMinimumBufferCount,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NumberOfPendingFrames => "NumberOfPendingFrames",
            Self::PixelBufferPoolIsShared => "PixelBufferPoolIsShared",
            Self::RealTime => "RealTime",
            Self::AverageBitRate => "AverageBitRate",
            Self::Quality => "Quality",
            Self::MaxKeyFrameInterval => "MaxKeyFrameInterval",
            Self::ExpectedFrameRate => "ExpectedFrameRate",
            Self::ProfileLevel => "ProfileLevel",
            Self::MultiPassStorage => "MultiPassStorage",
            Self::EncoderId => "EncoderId",
            Self::DecoderId => "DecoderId",
            Self::TemporalReorderDepth => "TemporalReorderDepth",
            Self::OutputPoolMinimumBufferCount => "OutputPoolMinimumBufferCount",
        }
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyKey {
    type Err = CodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CodingError::PropertyNotSupported { key: s.to_string() })
    }
}

/// A property value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    #[serde(skip)]
    Storage(Arc<dyn MultiPassStore>),
}

impl PropertyValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Bool(_) => ValueType::Bool,
            Self::Int(_) => ValueType::Int,
            Self::Float(_) => ValueType::Float,
            Self::Str(_) => ValueType::Str,
            Self::Storage(_) => ValueType::Storage,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float value; integers are widened.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_storage(&self) -> Option<&Arc<dyn MultiPassStore>> {
        match self {
            Self::Storage(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Storage(a), Self::Storage(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<Arc<dyn MultiPassStore>> for PropertyValue {
    fn from(v: Arc<dyn MultiPassStore>) -> Self {
        Self::Storage(v)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    Int,
    Float,
    Str,
    Storage,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Valid values for a property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    None,
    IntRange { min: i64, max: i64 },
    FloatRange { min: f64, max: f64 },
    OneOf(Vec<String>),
}

/// Schema entry for one supported property.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertySpec {
    pub key: PropertyKey,
    pub value_type: ValueType,
    pub access: Access,
    /// Safe to persist and replay on another session.
    pub serializable: bool,
    pub default: Option<PropertyValue>,
    pub constraint: Constraint,
}

impl PropertySpec {
    pub fn read_write(key: PropertyKey, value_type: ValueType) -> Self {
        Self {
            key,
            value_type,
            access: Access::ReadWrite,
            serializable: value_type != ValueType::Storage,
            default: None,
            constraint: Constraint::None,
        }
    }

    pub fn read_only(key: PropertyKey, value_type: ValueType) -> Self {
        Self {
            access: Access::ReadOnly,
            serializable: false,
            ..Self::read_write(key, value_type)
        }
    }

    pub fn with_default(mut self, value: impl Into<PropertyValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = constraint;
        self
    }

    pub fn is_writable(&self) -> bool {
        self.access == Access::ReadWrite
    }

    /// Check `value` against this schema entry, widening integers for
    /// float-typed properties.
    pub fn validate(&self, value: PropertyValue) -> CodingResult<PropertyValue> {
        let value = match (self.value_type, value) {
            (ValueType::Float, PropertyValue::Int(v)) => PropertyValue::Float(v as f64),
            (expected, value) if value.value_type() != expected => {
                return Err(CodingError::InvalidParameter(format!(
                    "{}: expected {expected:?}, got {:?}",
                    self.key,
                    value.value_type()
                )));
            }
            (_, value) => value,
        };

        let in_range = match (&self.constraint, &value) {
            (Constraint::None, _) => true,
            (Constraint::IntRange { min, max }, PropertyValue::Int(v)) => v >= min && v <= max,
            (Constraint::FloatRange { min, max }, PropertyValue::Float(v)) => {
                v >= min && v <= max
            }
            (Constraint::OneOf(options), PropertyValue::Str(s)) => options.contains(s),
            _ => false,
        };
        if !in_range {
            return Err(CodingError::InvalidParameter(format!(
                "{}: value {value:?} outside {:?}",
                self.key, self.constraint
            )));
        }
        Ok(value)
    }
}

/// Property values keyed by property, as exported for replay.
pub type PropertyMap = BTreeMap<PropertyKey, PropertyValue>;

/// The configuration of one session: its schema plus current values.
#[derive(Clone, Debug, Default)]
pub struct PropertyStore {
    specs: BTreeMap<PropertyKey, PropertySpec>,
    values: PropertyMap,
}

impl PropertyStore {
    pub fn new(specs: impl IntoIterator<Item = PropertySpec>) -> Self {
        Self {
            specs: specs.into_iter().map(|s| (s.key, s)).collect(),
            values: BTreeMap::new(),
        }
    }

    pub fn spec(&self, key: PropertyKey) -> CodingResult<&PropertySpec> {
        self.specs
            .get(&key)
            .ok_or_else(|| CodingError::PropertyNotSupported {
                key: key.to_string(),
            })
    }

    pub fn is_supported(&self, key: PropertyKey) -> bool {
        self.specs.contains_key(&key)
    }

    /// Set `key`; `None` resets it to its default.
    pub fn set(&mut self, key: PropertyKey, value: Option<PropertyValue>) -> CodingResult<()> {
        let checked = self.check_write(key, value)?;
        self.apply(key, checked);
        Ok(())
    }

    /// Set several properties. Nothing changes unless every entry is valid.
    pub fn set_many(
        &mut self,
        entries: impl IntoIterator<Item = (PropertyKey, Option<PropertyValue>)>,
    ) -> CodingResult<()> {
        let checked = entries
            .into_iter()
            .map(|(key, value)| Ok((key, self.check_write(key, value)?)))
            .collect::<CodingResult<Vec<_>>>()?;
        for (key, value) in checked {
            self.apply(key, value);
        }
        Ok(())
    }

    /// Current value, falling back to the default. `Ok(None)` means the
    /// property is supported but has no value.
    pub fn get(&self, key: PropertyKey) -> CodingResult<Option<PropertyValue>> {
        let spec = self.spec(key)?;
        Ok(self.values.get(&key).or(spec.default.as_ref()).cloned())
    }

    /// Update a value regardless of its access mode. Used by the owner of the
    /// store to publish read-only state.
    pub fn publish(&mut self, key: PropertyKey, value: PropertyValue) -> CodingResult<()> {
        let value = self.spec(key)?.validate(value)?;
        self.values.insert(key, value);
        Ok(())
    }

    /// The schema, ordered by key.
    pub fn supported(&self) -> Vec<PropertySpec> {
        self.specs.values().cloned().collect()
    }

    /// Current values of every writable, serializable property.
    pub fn serializable(&self) -> PropertyMap {
        self.specs
            .values()
            .filter(|spec| spec.serializable && spec.is_writable())
            .filter_map(|spec| {
                self.values
                    .get(&spec.key)
                    .or(spec.default.as_ref())
                    .map(|v| (spec.key, v.clone()))
            })
            .collect()
    }

    fn check_write(
        &self,
        key: PropertyKey,
        value: Option<PropertyValue>,
    ) -> CodingResult<Option<PropertyValue>> {
        let spec = self.spec(key)?;
        if !spec.is_writable() {
            return Err(CodingError::PropertyReadOnly {
                key: key.to_string(),
            });
        }
        value.map(|v| spec.validate(v)).transpose()
    }

    fn apply(&mut self, key: PropertyKey, value: Option<PropertyValue>) {
        match value {
            Some(v) => {
                self.values.insert(key, v);
            }
            None => {
                self.values.remove(&key);
            }
        }
    }
}
