//! Buffer metadata types.

/// A key-value pair for buffer metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraField {
    /// Field name.
    pub key: String,
    /// Field value.
    pub value: MetadataValue,
}

/// Possible values for metadata fields.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    /// String value.
    String(String),
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Boolean value.
    Bool(bool),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Key under which the scheduler stamps root outputs when timestamps are
/// enabled. The value is an `Int` holding wall clock nanoseconds.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Metadata carried by a buffer.
///
/// A small ordered list of key-value fields; buffers usually carry none or
/// a handful, so lookups are linear.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    fields: Vec<ExtraField>,
}

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing an existing value with the same key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|f| f.key == key) {
            Some(field) => field.value = value,
            None => self.fields.push(ExtraField { key, value }),
        }
    }

    /// Get a field by key.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.fields.iter().find(|f| f.key == key).map(|f| &f.value)
    }

    /// Get an integer field.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(MetadataValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Get a float field.
    pub fn get_float(&self, key: &str) -> Option<f64> {
        match self.get(key) {
            Some(MetadataValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    /// Remove a field, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<MetadataValue> {
        let pos = self.fields.iter().position(|f| f.key == key)?;
        Some(self.fields.remove(pos).value)
    }

    /// Iterate over all fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ExtraField> {
        self.fields.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Remove all fields.
    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Copy every field of `other` into `self`, overwriting equal keys.
    pub fn merge_from(&mut self, other: &Metadata) {
        for field in &other.fields {
            self.set(field.key.clone(), field.value.clone());
        }
    }
}
