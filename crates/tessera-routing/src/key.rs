use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use bson::spec::BinarySubtype;
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::KeyError;

// ── Type classes ──────────────────────────────────────────────
//
// Every encoded value starts with a class byte so that values of different
// types sort in the canonical cross-type order. All numeric types share one
// class and compare by value.

const CLASS_MIN_KEY: u8 = 0x01;
const CLASS_NULL: u8 = 0x0A;
const CLASS_NUMBER: u8 = 0x14;
const CLASS_STRING: u8 = 0x1E;
const CLASS_BINARY: u8 = 0x32;
const CLASS_OBJECT_ID: u8 = 0x3C;
const CLASS_BOOL: u8 = 0x46;
const CLASS_DATE: u8 = 0x50;
const CLASS_TIMESTAMP: u8 = 0x5A;
const CLASS_MAX_KEY: u8 = 0xFE;

const NUMBER_NAN: u8 = 0x00;
const NUMBER_VALUE: u8 = 0x01;

#[inline]
fn encode_i64_sortable(n: i64) -> [u8; 8] {
    ((n as u64) ^ 0x8000_0000_0000_0000).to_be_bytes()
}

#[inline]
fn encode_f64_sortable(f: f64) -> [u8; 8] {
    // -0.0 and 0.0 must encode identically.
    let f = if f == 0.0 { 0.0 } else { f };
    let bits = f.to_bits();
    let encoded = if (bits & 0x8000_0000_0000_0000) != 0 {
        !bits
    } else {
        bits ^ 0x8000_0000_0000_0000
    };
    encoded.to_be_bytes()
}

fn encode_number(f: f64, out: &mut Vec<u8>) {
    out.push(CLASS_NUMBER);
    if f.is_nan() {
        out.push(NUMBER_NAN);
    } else {
        out.push(NUMBER_VALUE);
        out.extend_from_slice(&encode_f64_sortable(f));
    }
}

/// Strings are zero-terminated; embedded zeros are escaped as `00 FF` so the
/// terminator `00 00` still sorts below any continuation.
fn encode_string(s: &str, out: &mut Vec<u8>) {
    out.push(CLASS_STRING);
    for &b in s.as_bytes() {
        out.push(b);
        if b == 0 {
            out.push(0xFF);
        }
    }
    out.extend_from_slice(&[0, 0]);
}

// ── KeyValue ──────────────────────────────────────────────────

/// One component of a shard key.
///
/// Kept separate from [`Bson`] so that persisted chunk bounds have a closed,
/// self-describing serde form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeyValue {
    MinKey,
    Null,
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Binary { subtype: u8, bytes: Vec<u8> },
    ObjectId([u8; 12]),
    Bool(bool),
    Date(i64),
    Timestamp { time: u32, increment: u32 },
    MaxKey,
}

impl KeyValue {
    pub fn from_bson(field: &str, value: &Bson) -> Result<Self, KeyError> {
        Ok(match value {
            Bson::MinKey => KeyValue::MinKey,
            Bson::MaxKey => KeyValue::MaxKey,
            Bson::Null | Bson::Undefined => KeyValue::Null,
            Bson::Int32(n) => KeyValue::Int32(*n),
            Bson::Int64(n) => KeyValue::Int64(*n),
            Bson::Double(f) => KeyValue::Double(*f),
            Bson::String(s) => KeyValue::String(s.clone()),
            Bson::Binary(b) => KeyValue::Binary {
                subtype: u8::from(b.subtype),
                bytes: b.bytes.clone(),
            },
            Bson::ObjectId(oid) => KeyValue::ObjectId(oid.bytes()),
            Bson::Boolean(b) => KeyValue::Bool(*b),
            Bson::DateTime(dt) => KeyValue::Date(dt.timestamp_millis()),
            Bson::Timestamp(ts) => KeyValue::Timestamp {
                time: ts.time,
                increment: ts.increment,
            },
            Bson::Array(_) => {
                return Err(KeyError::ArrayValue {
                    field: field.to_string(),
                });
            }
            other => {
                return Err(KeyError::UnsupportedType {
                    field: field.to_string(),
                    kind: format!("{:?}", other.element_type()),
                });
            }
        })
    }

    pub fn to_bson(&self) -> Bson {
        match self {
            KeyValue::MinKey => Bson::MinKey,
            KeyValue::MaxKey => Bson::MaxKey,
            KeyValue::Null => Bson::Null,
            KeyValue::Int32(n) => Bson::Int32(*n),
            KeyValue::Int64(n) => Bson::Int64(*n),
            KeyValue::Double(f) => Bson::Double(*f),
            KeyValue::String(s) => Bson::String(s.clone()),
            KeyValue::Binary { subtype, bytes } => Bson::Binary(bson::Binary {
                subtype: BinarySubtype::from(*subtype),
                bytes: bytes.clone(),
            }),
            KeyValue::ObjectId(b) => Bson::ObjectId(bson::oid::ObjectId::from_bytes(*b)),
            KeyValue::Bool(b) => Bson::Boolean(*b),
            KeyValue::Date(ms) => Bson::DateTime(bson::DateTime::from_millis(*ms)),
            KeyValue::Timestamp { time, increment } => Bson::Timestamp(bson::Timestamp {
                time: *time,
                increment: *increment,
            }),
        }
    }

    /// Append the order-preserving encoding of this value to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            KeyValue::MinKey => out.push(CLASS_MIN_KEY),
            KeyValue::MaxKey => out.push(CLASS_MAX_KEY),
            KeyValue::Null => out.push(CLASS_NULL),
            // Numbers compare as doubles; int64 beyond 2^53 loses precision.
            KeyValue::Int32(n) => encode_number(*n as f64, out),
            KeyValue::Int64(n) => encode_number(*n as f64, out),
            KeyValue::Double(f) => encode_number(*f, out),
            KeyValue::String(s) => encode_string(s, out),
            KeyValue::Binary { subtype, bytes } => {
                out.push(CLASS_BINARY);
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                out.push(*subtype);
                out.extend_from_slice(bytes);
            }
            KeyValue::ObjectId(b) => {
                out.push(CLASS_OBJECT_ID);
                out.extend_from_slice(b);
            }
            KeyValue::Bool(b) => {
                out.push(CLASS_BOOL);
                out.push(*b as u8);
            }
            KeyValue::Date(ms) => {
                out.push(CLASS_DATE);
                out.extend_from_slice(&encode_i64_sortable(*ms));
            }
            KeyValue::Timestamp { time, increment } => {
                out.push(CLASS_TIMESTAMP);
                out.extend_from_slice(&time.to_be_bytes());
                out.extend_from_slice(&increment.to_be_bytes());
            }
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::MinKey => f.write_str("MinKey"),
            KeyValue::MaxKey => f.write_str("MaxKey"),
            KeyValue::Null => f.write_str("null"),
            KeyValue::Int32(n) => write!(f, "{n}"),
            KeyValue::Int64(n) => write!(f, "{n}"),
            KeyValue::Double(x) => write!(f, "{x}"),
            KeyValue::String(s) => write!(f, "{s:?}"),
            other => write!(f, "{}", other.to_bson()),
        }
    }
}

/// Encode a single BSON value with the shard-key ordering. Used for `_id`
/// record keys as well as shard keys.
pub fn encode_value(field: &str, value: &Bson) -> Result<Vec<u8>, KeyError> {
    let mut out = Vec::with_capacity(16);
    KeyValue::from_bson(field, value)?.encode(&mut out);
    Ok(out)
}

// ── ShardKey ──────────────────────────────────────────────────

/// A point in shard-key space: one value per field of the key pattern.
///
/// Equality, ordering and hashing use the encoded bytes, so `{a: 5}` and
/// `{a: 5.0}` are the same key.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<KeyValue>", into = "Vec<KeyValue>")]
pub struct ShardKey {
    values: Vec<KeyValue>,
    encoded: Vec<u8>,
}

impl ShardKey {
    pub fn new(values: Vec<KeyValue>) -> Result<Self, KeyError> {
        if values.is_empty() {
            return Err(KeyError::EmptyPattern);
        }
        let mut encoded = Vec::with_capacity(values.len() * 10);
        for v in &values {
            v.encode(&mut encoded);
        }
        Ok(Self { values, encoded })
    }

    /// Build a key from BSON values, positionally matched to the pattern.
    pub fn from_bson(values: &[Bson]) -> Result<Self, KeyError> {
        let values = values
            .iter()
            .enumerate()
            .map(|(i, v)| KeyValue::from_bson(&i.to_string(), v))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(values)
    }

    pub fn min(arity: usize) -> Self {
        Self::filled(KeyValue::MinKey, arity)
    }

    pub fn max(arity: usize) -> Self {
        Self::filled(KeyValue::MaxKey, arity)
    }

    fn filled(value: KeyValue, arity: usize) -> Self {
        let arity = arity.max(1);
        let values = vec![value; arity];
        let mut encoded = Vec::with_capacity(arity);
        for v in &values {
            v.encode(&mut encoded);
        }
        Self { values, encoded }
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.values
    }

    pub fn arity(&self) -> usize {
        self.values.len()
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn is_min(&self) -> bool {
        self.values.iter().all(|v| matches!(v, KeyValue::MinKey))
    }

    pub fn is_max(&self) -> bool {
        self.values.iter().all(|v| matches!(v, KeyValue::MaxKey))
    }

    /// Render as a document keyed by the pattern's field names.
    pub fn to_document(&self, pattern: &KeyPattern) -> Document {
        let mut doc = Document::new();
        for (field, value) in pattern.fields().iter().zip(&self.values) {
            doc.insert(field.clone(), value.to_bson());
        }
        doc
    }
}

impl PartialEq for ShardKey {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for ShardKey {}

impl PartialOrd for ShardKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ShardKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.encoded.cmp(&other.encoded)
    }
}

impl Hash for ShardKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encoded.hash(state);
    }
}

impl fmt::Debug for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{ ")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(" }")
    }
}

impl TryFrom<Vec<KeyValue>> for ShardKey {
    type Error = KeyError;

    fn try_from(values: Vec<KeyValue>) -> Result<Self, Self::Error> {
        ShardKey::new(values)
    }
}

impl From<ShardKey> for Vec<KeyValue> {
    fn from(key: ShardKey) -> Self {
        key.values
    }
}

// ── KeyPattern ────────────────────────────────────────────────

/// Ordered list of (possibly dotted) field paths forming a shard key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct KeyPattern {
    fields: Vec<String>,
}

impl KeyPattern {
    pub fn new<I, S>(fields: I) -> Result<Self, KeyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(KeyError::EmptyPattern);
        }
        for (i, f) in fields.iter().enumerate() {
            if f.is_empty() || f.split('.').any(str::is_empty) || f.starts_with('$') {
                return Err(KeyError::InvalidPattern(f.clone()));
            }
            if fields[..i].contains(f) {
                return Err(KeyError::InvalidPattern(format!("duplicate field {f}")));
            }
        }
        Ok(Self { fields })
    }

    /// Parse `{a: 1, "b.c": 1}`. Only ascending range keys are supported.
    pub fn from_document(doc: &Document) -> Result<Self, KeyError> {
        for (field, value) in doc {
            let ok = match value {
                Bson::Int32(1) | Bson::Int64(1) => true,
                Bson::Double(f) => *f == 1.0,
                _ => false,
            };
            if !ok {
                return Err(KeyError::InvalidPattern(format!(
                    "field {field} must be 1, got {value}"
                )));
            }
        }
        Self::new(doc.keys().cloned())
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        for f in &self.fields {
            doc.insert(f.clone(), 1i32);
        }
        doc
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    pub fn min_key(&self) -> ShardKey {
        ShardKey::min(self.arity())
    }

    pub fn max_key(&self) -> ShardKey {
        ShardKey::max(self.arity())
    }

    /// Extract the shard key of a stored document. Missing fields are null.
    pub fn extract(&self, doc: &Document) -> Result<ShardKey, KeyError> {
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = match lookup_path(doc, field)? {
                Some(v) => KeyValue::from_bson(field, v)?,
                None => KeyValue::Null,
            };
            values.push(value);
        }
        ShardKey::new(values)
    }

    /// Extract the shard key from an equality filter. Returns `None` unless
    /// every field is pinned to a literal value.
    pub fn extract_from_filter(&self, filter: &Document) -> Result<Option<ShardKey>, KeyError> {
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let found = match filter.get(field) {
                Some(v) => Some(v),
                None => lookup_path(filter, field)?,
            };
            let Some(value) = found else {
                return Ok(None);
            };
            if let Bson::Document(d) = value
                && d.keys().any(|k| k.starts_with('$'))
            {
                return Ok(None);
            }
            values.push(KeyValue::from_bson(field, value)?);
        }
        ShardKey::new(values).map(Some)
    }

    /// Whether writing `path` would modify a shard-key field.
    pub fn touches(&self, path: &str) -> bool {
        self.fields.iter().any(|f| {
            f == path
                || f.strip_prefix(path).is_some_and(|rest| rest.starts_with('.'))
                || path.strip_prefix(f.as_str()).is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_document())
    }
}

impl TryFrom<Vec<String>> for KeyPattern {
    type Error = KeyError;

    fn try_from(fields: Vec<String>) -> Result<Self, Self::Error> {
        KeyPattern::new(fields)
    }
}

impl From<KeyPattern> for Vec<String> {
    fn from(p: KeyPattern) -> Self {
        p.fields
    }
}

/// Walk a dotted path through embedded documents. Arrays anywhere on the path
/// are rejected since a shard key must be a single value.
fn lookup_path<'a>(doc: &'a Document, path: &str) -> Result<Option<&'a Bson>, KeyError> {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return Ok(None);
    };
    let mut current = match doc.get(first) {
        Some(v) => v,
        None => return Ok(None),
    };
    for seg in segments {
        current = match current {
            Bson::Document(d) => match d.get(seg) {
                Some(v) => v,
                None => return Ok(None),
            },
            Bson::Array(_) => {
                return Err(KeyError::ArrayValue {
                    field: path.to_string(),
                });
            }
            _ => return Ok(None),
        };
    }
    if matches!(current, Bson::Array(_)) {
        return Err(KeyError::ArrayValue {
            field: path.to_string(),
        });
    }
    Ok(Some(current))
}
