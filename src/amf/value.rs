//! AMF0 value model
//!
//! Object properties keep their wire order. Backends and players read
//! command objects by key, but some tools compare `_result` replies
//! byte-for-byte, so re-encoding must not reorder them.

/// Ordered key/value list of an object or ECMA array
pub type Properties = Vec<(String, AmfValue)>;

/// An AMF0 value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AmfValue {
    /// 0x00
    Number(f64),

    /// 0x01
    Boolean(bool),

    /// 0x02, or 0x0C when longer than 65535 bytes
    String(String),

    /// 0x03
    Object(Properties),

    /// 0x05
    #[default]
    Null,

    /// 0x06
    Undefined,

    /// 0x08, associative array with a count hint
    EcmaArray(Properties),

    /// 0x0A
    StrictArray(Vec<AmfValue>),

    /// 0x0B, milliseconds since the Unix epoch; the timezone is ignored
    Date(f64),

    /// 0x0F
    Xml(String),
}

impl AmfValue {
    /// Build an object from `(key, value)` pairs
    pub fn object<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<AmfValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        AmfValue::Object(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Build an ECMA array from `(key, value)` pairs
    pub fn ecma_array<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<AmfValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        AmfValue::EcmaArray(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) | AmfValue::Xml(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Properties of an object or ECMA array
    pub fn as_properties(&self) -> Option<&Properties> {
        match self {
            AmfValue::Object(p) | AmfValue::EcmaArray(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, AmfValue::Null | AmfValue::Undefined)
    }

    /// First property named `key`
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_properties()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }

    /// Replace property `key` in place, or append it
    ///
    /// Has no effect on values that are not objects or ECMA arrays.
    pub fn set(&mut self, key: &str, value: impl Into<AmfValue>) {
        let props = match self {
            AmfValue::Object(p) | AmfValue::EcmaArray(p) => p,
            _ => return,
        };
        let value = value.into();
        match props.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => props.push((key.to_string(), value)),
        }
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<f64> for AmfValue {
    fn from(v: f64) -> Self {
        AmfValue::Number(v)
    }
}

impl From<u32> for AmfValue {
    fn from(v: u32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}
