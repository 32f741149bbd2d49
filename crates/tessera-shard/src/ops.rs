//! Operation descriptors and results exchanged between routers and shards.

use std::cmp::Ordering;

use bson::{Bson, Document, doc};
use serde::{Deserialize, Serialize};
use tessera_routing::{CollectionUuid, KeyPattern, KeyValue, ShardVersion};

use crate::error::ShardError;

/// Which documents an operation applies to. Filters are conjunctions of
/// equality predicates on (possibly dotted) paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Selector {
    All,
    Id(Bson),
    Eq(Document),
}

impl Selector {
    /// The selector as an equality filter document.
    pub fn as_filter(&self) -> Document {
        match self {
            Selector::All => Document::new(),
            Selector::Id(id) => doc! { "_id": id.clone() },
            Selector::Eq(d) => d.clone(),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Selector::All => true,
            Selector::Id(id) => doc.get("_id").is_some_and(|v| values_equal(v, id)),
            Selector::Eq(filter) => filter
                .iter()
                .all(|(path, expected)| lookup(doc, path).is_some_and(|v| values_equal(v, expected))),
        }
    }

    pub fn id(&self) -> Option<&Bson> {
        match self {
            Selector::Id(id) => Some(id),
            Selector::Eq(d) => d.get("_id"),
            Selector::All => None,
        }
    }
}

/// Scalar equality with numeric types compared by value.
pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (KeyValue::from_bson("", a), KeyValue::from_bson("", b)) {
        (Ok(x), Ok(y)) => {
            let (mut ex, mut ey) = (Vec::new(), Vec::new());
            x.encode(&mut ex);
            y.encode(&mut ey);
            ex.cmp(&ey) == Ordering::Equal
        }
        _ => a == b,
    }
}

pub(crate) fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for seg in segments {
        current = match current {
            Bson::Document(d) => d.get(seg)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<(), ShardError> {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !doc.contains_key(head) {
                doc.insert(head, Document::new());
            }
            match doc.get_mut(head) {
                Some(Bson::Document(inner)) => set_path(inner, rest, value),
                _ => Err(ShardError::BadValue(format!(
                    "cannot create field {rest} in non-document {head}"
                ))),
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                unset_path(inner, rest);
            }
        }
    }
}

fn add_numbers(current: Option<&Bson>, delta: &Bson) -> Result<Bson, ShardError> {
    let current = current.cloned().unwrap_or(Bson::Int32(0));
    Ok(match (&current, delta) {
        (Bson::Int32(a), Bson::Int32(b)) => match a.checked_add(*b) {
            Some(v) => Bson::Int32(v),
            None => Bson::Int64(*a as i64 + *b as i64),
        },
        (Bson::Int32(a), Bson::Int64(b)) => Bson::Int64(*a as i64 + b),
        (Bson::Int64(a), Bson::Int32(b)) => Bson::Int64(a + *b as i64),
        (Bson::Int64(a), Bson::Int64(b)) => Bson::Int64(a + b),
        (Bson::Double(a), other) | (other, Bson::Double(a)) => {
            let b = match other {
                Bson::Int32(n) => *n as f64,
                Bson::Int64(n) => *n as f64,
                Bson::Double(f) => *f,
                _ => return Err(ShardError::BadValue("$inc on non-numeric value".into())),
            };
            Bson::Double(a + b)
        }
        _ => return Err(ShardError::BadValue("$inc on non-numeric value".into())),
    })
}

/// How to change a matched document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateSpec {
    Replace(Document),
    Modify {
        #[serde(default)]
        set: Document,
        #[serde(default)]
        inc: Document,
        #[serde(default)]
        unset: Vec<String>,
    },
}

impl UpdateSpec {
    pub fn set(set: Document) -> Self {
        UpdateSpec::Modify {
            set,
            inc: Document::new(),
            unset: Vec::new(),
        }
    }

    pub fn inc(inc: Document) -> Self {
        UpdateSpec::Modify {
            set: Document::new(),
            inc,
            unset: Vec::new(),
        }
    }

    /// Produce the post-image of `doc`. `_id` and shard-key fields may not
    /// change value.
    pub fn apply(&self, doc: &Document, pattern: Option<&KeyPattern>) -> Result<Document, ShardError> {
        let next = match self {
            UpdateSpec::Replace(replacement) => {
                let mut next = Document::new();
                if let Some(id) = doc.get("_id") {
                    next.insert("_id", id.clone());
                }
                for (k, v) in replacement {
                    if k != "_id" {
                        next.insert(k.clone(), v.clone());
                    }
                }
                if let Some(new_id) = replacement.get("_id")
                    && doc.get("_id").is_some_and(|old| !values_equal(old, new_id))
                {
                    return Err(ShardError::ImmutableField("_id".into()));
                }
                next
            }
            UpdateSpec::Modify { set, inc, unset } => {
                let mut next = doc.clone();
                for (path, value) in set {
                    set_path(&mut next, path, value.clone())?;
                }
                for (path, delta) in inc {
                    let sum = add_numbers(lookup(&next, path), delta)?;
                    set_path(&mut next, path, sum)?;
                }
                for path in unset {
                    unset_path(&mut next, path);
                }
                next
            }
        };
        check_immutable(doc, &next, pattern)?;
        Ok(next)
    }

    /// Build the document inserted by an upsert that matched nothing.
    pub fn upsert_document(&self, selector: &Selector) -> Result<Document, ShardError> {
        let mut base = Document::new();
        for (path, value) in selector.as_filter() {
            set_path(&mut base, &path, value)?;
        }
        let mut doc = match self {
            UpdateSpec::Replace(replacement) => {
                let mut doc = Document::new();
                if let Some(id) = base.get("_id").or_else(|| replacement.get("_id")) {
                    doc.insert("_id", id.clone());
                }
                for (k, v) in replacement {
                    if k != "_id" {
                        doc.insert(k.clone(), v.clone());
                    }
                }
                doc
            }
            modify => modify.apply(&base, None)?,
        };
        if !doc.contains_key("_id") {
            let mut with_id = doc! { "_id": bson::oid::ObjectId::new() };
            with_id.extend(doc);
            doc = with_id;
        }
        Ok(doc)
    }
}

fn check_immutable(before: &Document, after: &Document, pattern: Option<&KeyPattern>) -> Result<(), ShardError> {
    let same = |path: &str| match (lookup(before, path), lookup(after, path)) {
        (Some(a), Some(b)) => values_equal(a, b),
        (None, None) => true,
        _ => false,
    };
    if !same("_id") {
        return Err(ShardError::ImmutableField("_id".into()));
    }
    if let Some(pattern) = pattern {
        for field in pattern.fields() {
            if !same(field) {
                return Err(ShardError::ImmutableField(field.clone()));
            }
        }
    }
    Ok(())
}

// ── Results ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsertResult {
    pub inserted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub deleted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastErrorObject {
    pub n: u64,
    pub updated_existing: bool,
    pub upserted: Option<Bson>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindAndModifyResult {
    pub last_error_object: LastErrorObject,
    pub value: Option<Document>,
}

/// A write result as stored in session history and sent on the wire.
pub trait WriteResponse: Sized {
    fn to_document(&self) -> Document;
    fn from_document(doc: &Document) -> Result<Self, ShardError>;
}

fn malformed(what: &str) -> ShardError {
    ShardError::Encoding(format!("malformed write response: {what}"))
}

fn get_count(doc: &Document, field: &str) -> Result<u64, ShardError> {
    match doc.get(field) {
        Some(Bson::Int64(n)) => Ok(*n as u64),
        Some(Bson::Int32(n)) => Ok(*n as u64),
        _ => Err(malformed(field)),
    }
}

impl WriteResponse for InsertResult {
    fn to_document(&self) -> Document {
        doc! { "n": self.inserted as i64 }
    }

    fn from_document(doc: &Document) -> Result<Self, ShardError> {
        Ok(Self {
            inserted: get_count(doc, "n")?,
        })
    }
}

impl WriteResponse for UpdateResult {
    fn to_document(&self) -> Document {
        let mut out = doc! {
            "n": self.matched as i64,
            "nModified": self.modified as i64,
        };
        if let Some(id) = &self.upserted_id {
            out.insert("upserted", id.clone());
        }
        out
    }

    fn from_document(doc: &Document) -> Result<Self, ShardError> {
        Ok(Self {
            matched: get_count(doc, "n")?,
            modified: get_count(doc, "nModified")?,
            upserted_id: doc.get("upserted").cloned(),
        })
    }
}

impl WriteResponse for DeleteResult {
    fn to_document(&self) -> Document {
        doc! { "n": self.deleted as i64 }
    }

    fn from_document(doc: &Document) -> Result<Self, ShardError> {
        Ok(Self {
            deleted: get_count(doc, "n")?,
        })
    }
}

impl WriteResponse for FindAndModifyResult {
    fn to_document(&self) -> Document {
        let mut leo = doc! {
            "n": self.last_error_object.n as i64,
            "updatedExisting": self.last_error_object.updated_existing,
        };
        if let Some(id) = &self.last_error_object.upserted {
            leo.insert("upserted", id.clone());
        }
        doc! {
            "lastErrorObject": leo,
            "value": self.value.clone().map(Bson::Document).unwrap_or(Bson::Null),
        }
    }

    fn from_document(doc: &Document) -> Result<Self, ShardError> {
        let leo = doc
            .get_document("lastErrorObject")
            .map_err(|_| malformed("lastErrorObject"))?;
        Ok(Self {
            last_error_object: LastErrorObject {
                n: get_count(leo, "n")?,
                updated_existing: leo
                    .get_bool("updatedExisting")
                    .map_err(|_| malformed("updatedExisting"))?,
                upserted: leo.get("upserted").cloned(),
            },
            value: match doc.get("value") {
                Some(Bson::Document(d)) => Some(d.clone()),
                _ => None,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindAndModify {
    pub selector: Selector,
    pub update: Option<UpdateSpec>,
    pub remove: bool,
    pub upsert: bool,
    /// Return the post-image instead of the pre-image.
    pub return_new: bool,
}

// ── Sessions ────────────────────────────────────────────────

/// Logical session plus transaction number. Retryable writes and
/// multi-statement transactions are both keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionInfo {
    pub lsid: [u8; 16],
    pub txn_number: i64,
}

impl SessionInfo {
    pub fn new(lsid: [u8; 16], txn_number: i64) -> Self {
        Self { lsid, txn_number }
    }

    pub fn lsid_string(&self) -> String {
        CollectionUuid::from_bytes(self.lsid).to_string()
    }
}

/// Context every data operation carries from router to shard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpContext {
    /// `None` for direct operations that bypass a router.
    pub shard_version: Option<ShardVersion>,
    pub session: Option<SessionInfo>,
    pub stmt_id: Option<i32>,
    /// Part of a multi-statement transaction.
    pub in_transaction: bool,
    /// First statement of the transaction on this shard.
    pub start_transaction: bool,
    pub expected_uuid: Option<CollectionUuid>,
}

impl OpContext {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn versioned(version: ShardVersion) -> Self {
        Self {
            shard_version: Some(version),
            ..Self::default()
        }
    }

    /// Retryable write identity, if any.
    pub(crate) fn retryable(&self) -> Option<(SessionInfo, i32)> {
        if self.in_transaction {
            return None;
        }
        Some((self.session?, self.stmt_id.unwrap_or(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_numbers_by_value() {
        let doc = doc! { "_id": 7, "a": { "b": 2.0 } };
        assert!(Selector::Id(Bson::Int64(7)).matches(&doc));
        assert!(Selector::Eq(doc! { "a.b": 2 }).matches(&doc));
        assert!(!Selector::Eq(doc! { "a.b": 3 }).matches(&doc));
        assert!(Selector::All.matches(&doc));
    }

    #[test]
    fn modify_sets_nested_and_increments() {
        let doc = doc! { "_id": 1, "count": 1, "meta": { "tag": "x" } };
        let spec = UpdateSpec::Modify {
            set: doc! { "meta.tag": "y", "meta.new": true },
            inc: doc! { "count": 1 },
            unset: vec![],
        };
        let next = spec.apply(&doc, None).unwrap();
        assert_eq!(
            next,
            doc! { "_id": 1, "count": 2, "meta": { "tag": "y", "new": true } }
        );
    }

    #[test]
    fn shard_key_and_id_are_immutable() {
        let pattern = KeyPattern::new(["region"]).unwrap();
        let doc = doc! { "_id": 1, "region": "eu" };
        let err = UpdateSpec::set(doc! { "region": "us" })
            .apply(&doc, Some(&pattern))
            .unwrap_err();
        assert!(matches!(err, ShardError::ImmutableField(f) if f == "region"));

        let err = UpdateSpec::Replace(doc! { "_id": 2, "region": "eu" })
            .apply(&doc, Some(&pattern))
            .unwrap_err();
        assert!(matches!(err, ShardError::ImmutableField(f) if f == "_id"));

        // Setting the same value is allowed.
        UpdateSpec::set(doc! { "region": "eu", "x": 1 })
            .apply(&doc, Some(&pattern))
            .unwrap();
    }

    #[test]
    fn upsert_builds_from_filter_and_update() {
        let doc = UpdateSpec::inc(doc! { "n": 1 })
            .upsert_document(&Selector::Eq(doc! { "_id": 5, "kind": "a" }))
            .unwrap();
        assert_eq!(doc, doc! { "_id": 5, "kind": "a", "n": 1 });

        let generated = UpdateSpec::Replace(doc! { "v": 1 })
            .upsert_document(&Selector::All)
            .unwrap();
        assert!(matches!(generated.get("_id"), Some(Bson::ObjectId(_))));
    }

    #[test]
    fn update_response_keeps_upserted_id() {
        let result = UpdateResult {
            matched: 0,
            modified: 0,
            upserted_id: Some(Bson::Int32(4)),
        };
        let doc = result.to_document();
        assert_eq!(doc.get_i64("n").unwrap(), 0);
        assert_eq!(UpdateResult::from_document(&doc).unwrap(), result);
    }

    #[test]
    fn find_and_modify_response_round_trips() {
        let result = FindAndModifyResult {
            last_error_object: LastErrorObject {
                n: 1,
                updated_existing: true,
                upserted: None,
            },
            value: Some(doc! { "_id": 1, "counter": 1 }),
        };
        let back = FindAndModifyResult::from_document(&result.to_document()).unwrap();
        assert_eq!(back, result);
    }
}
