//! Byte layout of everything a shard keeps in its store.

use bson::{Bson, Document, doc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tessera_routing::{CollectionUuid, KeyPattern, ShardKey, encode_value};

use crate::error::ShardError;

pub(crate) const CATALOG_TABLE: &str = "_catalog";
pub(crate) const OPLOG_TABLE: &str = "_oplog";
pub(crate) const RANGE_DELETIONS_TABLE: &str = "_range_deletions";
pub(crate) const SESSIONS_TABLE: &str = "_sessions";
pub(crate) const SESSION_HIGHWATER_TABLE: &str = "_session_highwater";

pub(crate) fn data_table(uuid: &CollectionUuid) -> String {
    format!("data.{uuid}")
}

pub(crate) fn shard_key_table(uuid: &CollectionUuid) -> String {
    format!("skidx.{uuid}")
}

pub fn encode_document(doc: &Document) -> Result<Vec<u8>, ShardError> {
    let mut buf = Vec::with_capacity(64);
    doc.to_writer(&mut buf)
        .map_err(|e| ShardError::Encoding(e.to_string()))?;
    Ok(buf)
}

pub fn decode_document(bytes: &[u8]) -> Result<Document, ShardError> {
    Document::from_reader(bytes).map_err(|e| ShardError::Encoding(e.to_string()))
}

pub(crate) fn encode_meta<T: Serialize>(value: &T) -> Result<Vec<u8>, ShardError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub(crate) fn decode_meta<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ShardError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Record key for a document: its `_id` in shard-key order.
pub(crate) fn id_key(id: &Bson) -> Result<Vec<u8>, ShardError> {
    encode_value("_id", id).map_err(|e| ShardError::BadValue(e.to_string()))
}

pub(crate) fn document_id(doc: &Document) -> Result<&Bson, ShardError> {
    doc.get("_id")
        .ok_or_else(|| ShardError::BadValue("document has no _id".into()))
}

/// Shard-key index entry: `[shard key][_id]`, valued with the `_id` key.
/// Shard-key encodings are
/// self-delimiting, so a range scan over `[min, max)` of the index visits
/// exactly the documents whose key lies in the range.
pub(crate) fn shard_key_entry(key: &ShardKey, id_key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.encoded().len() + id_key.len());
    buf.extend_from_slice(key.encoded());
    buf.extend_from_slice(id_key);
    buf
}

/// `{_id}` plus the shard-key fields, identifying a document in events.
pub fn document_key(doc: &Document, pattern: Option<&KeyPattern>) -> Document {
    let mut key = doc! {};
    if let Some(id) = doc.get("_id") {
        key.insert("_id", id.clone());
    }
    if let Some(pattern) = pattern {
        for field in pattern.fields() {
            if field == "_id" {
                continue;
            }
            if let Ok(sk) = KeyPattern::new([field.clone()]).and_then(|p| p.extract(doc))
                && let Some(v) = sk.values().first()
            {
                key.insert(field.clone(), v.to_bson());
            }
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_round_trip_byte_identical() {
        let doc = doc! { "_id": 1, "n": 2.5, "s": "x", "nested": { "a": [1, 2] } };
        let bytes = encode_document(&doc).unwrap();
        let back = decode_document(&bytes).unwrap();
        assert_eq!(back, doc);
        assert_eq!(encode_document(&back).unwrap(), bytes);
    }

    #[test]
    fn document_key_includes_shard_key_fields() {
        let pattern = KeyPattern::new(["region"]).unwrap();
        let doc = doc! { "_id": 3, "region": "eu", "qty": 1 };
        assert_eq!(
            document_key(&doc, Some(&pattern)),
            doc! { "_id": 3, "region": "eu" }
        );
        assert_eq!(document_key(&doc, None), doc! { "_id": 3 });
    }
}
