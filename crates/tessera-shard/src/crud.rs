//! Document reads and writes on a shard, shared by plain writes, retryable
//! writes and transaction statements.

use bson::{Document, doc};
use tessera_routing::{Namespace, RoutingTable, ShardId, ShardKey};
use tessera_store::{MemoryTransaction, Store, Transaction};

use crate::catalog::LocalCollection;
use crate::error::ShardError;
use crate::oplog::OpKind;
use crate::ops::{
    DeleteResult, FindAndModify, FindAndModifyResult, InsertResult, LastErrorObject, OpContext,
    Selector, UpdateResult, UpdateSpec,
};
use crate::record;
use crate::shard::{Placement, Shard};
use crate::write::WriteBatch;

pub(crate) trait ReadDocuments {
    fn get_doc(&self, coll: &LocalCollection, id_key: &[u8]) -> Result<Option<Document>, ShardError>;
    fn all_docs(&self, coll: &LocalCollection) -> Result<Vec<Document>, ShardError>;
}

pub(crate) trait WriteDocuments: ReadDocuments {
    fn put_doc(
        &mut self,
        coll: &LocalCollection,
        doc: &Document,
        previous: Option<&Document>,
        kind: OpKind,
    ) -> Result<(), ShardError>;
    fn delete_doc(&mut self, coll: &LocalCollection, doc: &Document) -> Result<(), ShardError>;
}

impl ReadDocuments for MemoryTransaction<'_> {
    fn get_doc(&self, coll: &LocalCollection, id_key: &[u8]) -> Result<Option<Document>, ShardError> {
        self.get(&coll.data_table(), id_key)?
            .map(|b| record::decode_document(&b))
            .transpose()
    }

    fn all_docs(&self, coll: &LocalCollection) -> Result<Vec<Document>, ShardError> {
        let mut out = Vec::new();
        for item in self.scan(&coll.data_table(), ..)? {
            let (_, bytes) = item?;
            out.push(record::decode_document(&bytes)?);
        }
        Ok(out)
    }
}

impl ReadDocuments for WriteBatch<'_> {
    fn get_doc(&self, coll: &LocalCollection, id_key: &[u8]) -> Result<Option<Document>, ShardError> {
        self.txn().get_doc(coll, id_key)
    }

    fn all_docs(&self, coll: &LocalCollection) -> Result<Vec<Document>, ShardError> {
        self.txn().all_docs(coll)
    }
}

impl WriteDocuments for WriteBatch<'_> {
    fn put_doc(
        &mut self,
        coll: &LocalCollection,
        doc: &Document,
        previous: Option<&Document>,
        kind: OpKind,
    ) -> Result<(), ShardError> {
        self.put_document(coll, doc, previous, kind)
    }

    fn delete_doc(&mut self, coll: &LocalCollection, doc: &Document) -> Result<(), ShardError> {
        self.delete_document(coll, doc)
    }
}

/// A collection plus, when orphans must be hidden, the routing table that
/// decides which documents this shard owns.
pub(crate) struct Scope<'a> {
    coll: &'a LocalCollection,
    owner: Option<(&'a RoutingTable, &'a ShardId)>,
}

impl Scope<'_> {
    fn shard_key(&self, doc: &Document) -> Result<Option<ShardKey>, ShardError> {
        match self.owner {
            Some((table, _)) => table
                .key_pattern()
                .extract(doc)
                .map(Some)
                .map_err(|e| ShardError::BadValue(e.to_string())),
            None => Ok(None),
        }
    }

    fn owns(&self, doc: &Document) -> bool {
        match self.owner {
            Some((table, shard)) => table
                .key_pattern()
                .extract(doc)
                .is_ok_and(|key| table.owns(shard, &key)),
            None => true,
        }
    }

    fn pattern(&self) -> Option<&tessera_routing::KeyPattern> {
        self.coll.key_pattern.as_ref()
    }

    /// Refuse to create a document this shard does not own.
    fn check_insertable(&self, doc: &Document) -> Result<(), ShardError> {
        if let Some(key) = self.shard_key(doc)?
            && !self.owns(doc)
        {
            return Err(ShardError::IllegalOperation(format!(
                "document with shard key {key} does not belong to this shard's chunks of {}",
                self.coll.ns
            )));
        }
        Ok(())
    }
}

/// Give a document an `_id` if it lacks one, as the first field.
/// `doc` with a generated `_id` in front when it has none.
pub fn with_id(doc: Document) -> Document {
    if doc.contains_key("_id") {
        return doc;
    }
    let mut out = doc! { "_id": bson::oid::ObjectId::new() };
    out.extend(doc);
    out
}

pub(crate) fn select<D: ReadDocuments + ?Sized>(
    docs: &D,
    scope: &Scope<'_>,
    selector: &Selector,
    first_only: bool,
) -> Result<Vec<Document>, ShardError> {
    let candidates = match selector.id() {
        Some(id) => docs
            .get_doc(scope.coll, &record::id_key(id)?)?
            .into_iter()
            .collect(),
        None => docs.all_docs(scope.coll)?,
    };
    let mut out = Vec::new();
    for doc in candidates {
        if selector.matches(&doc) && scope.owns(&doc) {
            out.push(doc);
            if first_only {
                break;
            }
        }
    }
    Ok(out)
}

fn insert_new<D: WriteDocuments + ?Sized>(
    docs: &mut D,
    scope: &Scope<'_>,
    doc: &Document,
) -> Result<(), ShardError> {
    scope.check_insertable(doc)?;
    let id = record::document_id(doc)?;
    if docs.get_doc(scope.coll, &record::id_key(id)?)?.is_some() {
        return Err(ShardError::DuplicateKey(format!(
            "{} already holds _id {id}",
            scope.coll.ns
        )));
    }
    docs.put_doc(scope.coll, doc, None, OpKind::Insert)
}

pub(crate) fn insert_all<D: WriteDocuments + ?Sized>(
    docs: &mut D,
    scope: &Scope<'_>,
    batch: &[Document],
) -> Result<(InsertResult, Vec<Document>), ShardError> {
    for doc in batch {
        insert_new(docs, scope, doc)?;
    }
    Ok((
        InsertResult {
            inserted: batch.len() as u64,
        },
        batch.to_vec(),
    ))
}

fn update_kind(spec: &UpdateSpec) -> OpKind {
    match spec {
        UpdateSpec::Replace(_) => OpKind::Replace,
        UpdateSpec::Modify { .. } => OpKind::Update,
    }
}

pub(crate) fn update_matching<D: WriteDocuments + ?Sized>(
    docs: &mut D,
    scope: &Scope<'_>,
    selector: &Selector,
    spec: &UpdateSpec,
    multi: bool,
    upsert: bool,
) -> Result<(UpdateResult, Vec<Document>), ShardError> {
    let matched = select(docs, scope, selector, !multi)?;
    if matched.is_empty() {
        if !upsert {
            return Ok((UpdateResult::default(), Vec::new()));
        }
        let doc = spec.upsert_document(selector)?;
        insert_new(docs, scope, &doc)?;
        let id = record::document_id(&doc)?.clone();
        return Ok((
            UpdateResult {
                matched: 0,
                modified: 0,
                upserted_id: Some(id),
            },
            vec![doc],
        ));
    }
    let mut result = UpdateResult {
        matched: matched.len() as u64,
        ..UpdateResult::default()
    };
    let mut affected = Vec::new();
    for doc in matched {
        let next = spec.apply(&doc, scope.pattern())?;
        if next != doc {
            docs.put_doc(scope.coll, &next, Some(&doc), update_kind(spec))?;
            result.modified += 1;
            affected.push(next);
        }
    }
    Ok((result, affected))
}

pub(crate) fn delete_matching<D: WriteDocuments + ?Sized>(
    docs: &mut D,
    scope: &Scope<'_>,
    selector: &Selector,
    multi: bool,
) -> Result<(DeleteResult, Vec<Document>), ShardError> {
    let matched = select(docs, scope, selector, !multi)?;
    for doc in &matched {
        docs.delete_doc(scope.coll, doc)?;
    }
    Ok((
        DeleteResult {
            deleted: matched.len() as u64,
        },
        matched,
    ))
}

pub(crate) fn find_and_modify<D: WriteDocuments + ?Sized>(
    docs: &mut D,
    scope: &Scope<'_>,
    request: &FindAndModify,
) -> Result<(FindAndModifyResult, Vec<Document>), ShardError> {
    let found = select(docs, scope, &request.selector, true)?.into_iter().next();
    if request.remove {
        return Ok(match found {
            Some(doc) => {
                docs.delete_doc(scope.coll, &doc)?;
                (
                    FindAndModifyResult {
                        last_error_object: LastErrorObject {
                            n: 1,
                            ..LastErrorObject::default()
                        },
                        value: Some(doc.clone()),
                    },
                    vec![doc],
                )
            }
            None => (FindAndModifyResult::default(), Vec::new()),
        });
    }

    let spec = request
        .update
        .as_ref()
        .ok_or_else(|| ShardError::BadValue("findAndModify needs update or remove".into()))?;
    match found {
        Some(doc) => {
            let next = spec.apply(&doc, scope.pattern())?;
            if next != doc {
                docs.put_doc(scope.coll, &next, Some(&doc), update_kind(spec))?;
            }
            let value = if request.return_new { next.clone() } else { doc };
            Ok((
                FindAndModifyResult {
                    last_error_object: LastErrorObject {
                        n: 1,
                        updated_existing: true,
                        upserted: None,
                    },
                    value: Some(value),
                },
                vec![next],
            ))
        }
        None if request.upsert => {
            let doc = spec.upsert_document(&request.selector)?;
            insert_new(docs, scope, &doc)?;
            let id = record::document_id(&doc)?.clone();
            Ok((
                FindAndModifyResult {
                    last_error_object: LastErrorObject {
                        n: 1,
                        updated_existing: false,
                        upserted: Some(id),
                    },
                    value: request.return_new.then(|| doc.clone()),
                },
                vec![doc],
            ))
        }
        None => Ok((FindAndModifyResult::default(), Vec::new())),
    }
}

fn missing_collection(ns: &Namespace) -> ShardError {
    ShardError::Internal(format!("write to {ns} has no local collection"))
}

impl Shard {
    fn scope<'a>(&'a self, coll: &'a LocalCollection, placement: &'a Placement, hide_orphans: bool) -> Scope<'a> {
        Scope {
            coll,
            owner: if hide_orphans {
                placement.table().map(|t| (&**t, self.id()))
            } else {
                None
            },
        }
    }

    fn key_hint(&self, ns: &Namespace, doc: &Document) -> Option<ShardKey> {
        self.cached_key_pattern(ns)?.extract(doc).ok()
    }

    fn filter_key_hint(&self, ns: &Namespace, selector: &Selector) -> Option<ShardKey> {
        self.cached_key_pattern(ns)?
            .extract_from_filter(&selector.as_filter())
            .ok()
            .flatten()
    }

    pub fn insert(&self, ns: &Namespace, docs: Vec<Document>, ctx: &OpContext) -> Result<InsertResult, ShardError> {
        let docs: Vec<Document> = docs.into_iter().map(with_id).collect();
        if ctx.in_transaction {
            return self.run_txn_statement(ns, ctx, true, |d, coll, placement| {
                let coll = coll.ok_or_else(|| missing_collection(ns))?;
                insert_all(d, &self.scope(coll, placement, true), &docs).map(|(r, _)| r)
            });
        }
        let hint = match docs.as_slice() {
            [single] => self.key_hint(ns, single),
            _ => None,
        };
        self.run_write(ns, ctx, hint.as_ref(), |batch, coll, placement| {
            insert_all(batch, &self.scope(coll, placement, true), &docs)
        })
    }

    pub fn update(
        &self,
        ns: &Namespace,
        selector: &Selector,
        spec: &UpdateSpec,
        multi: bool,
        upsert: bool,
        ctx: &OpContext,
    ) -> Result<UpdateResult, ShardError> {
        if ctx.in_transaction {
            return self.run_txn_statement(ns, ctx, true, |d, coll, placement| {
                let coll = coll.ok_or_else(|| missing_collection(ns))?;
                update_matching(d, &self.scope(coll, placement, true), selector, spec, multi, upsert)
                    .map(|(r, _)| r)
            });
        }
        let hint = self.filter_key_hint(ns, selector);
        self.run_write(ns, ctx, hint.as_ref(), |batch, coll, placement| {
            update_matching(batch, &self.scope(coll, placement, true), selector, spec, multi, upsert)
        })
    }

    pub fn delete(
        &self,
        ns: &Namespace,
        selector: &Selector,
        multi: bool,
        ctx: &OpContext,
    ) -> Result<DeleteResult, ShardError> {
        if ctx.in_transaction {
            return self.run_txn_statement(ns, ctx, true, |d, coll, placement| {
                let coll = coll.ok_or_else(|| missing_collection(ns))?;
                delete_matching(d, &self.scope(coll, placement, true), selector, multi).map(|(r, _)| r)
            });
        }
        let hint = self.filter_key_hint(ns, selector);
        self.run_write(ns, ctx, hint.as_ref(), |batch, coll, placement| {
            delete_matching(batch, &self.scope(coll, placement, true), selector, multi)
        })
    }

    pub fn find_and_modify(
        &self,
        ns: &Namespace,
        request: &FindAndModify,
        ctx: &OpContext,
    ) -> Result<FindAndModifyResult, ShardError> {
        if ctx.in_transaction {
            return self.run_txn_statement(ns, ctx, true, |d, coll, placement| {
                let coll = coll.ok_or_else(|| missing_collection(ns))?;
                find_and_modify(d, &self.scope(coll, placement, true), request).map(|(r, _)| r)
            });
        }
        let hint = self.filter_key_hint(ns, &request.selector);
        self.run_write(ns, ctx, hint.as_ref(), |batch, coll, placement| {
            find_and_modify(batch, &self.scope(coll, placement, true), request)
        })
    }

    /// Documents matching `selector`. Versioned reads hide orphans; direct
    /// reads see everything physically stored.
    pub fn find(&self, ns: &Namespace, selector: &Selector, ctx: &OpContext) -> Result<Vec<Document>, ShardError> {
        let hide_orphans = ctx.shard_version.is_some();
        if ctx.in_transaction {
            return self.run_txn_statement(ns, ctx, false, |d, coll, placement| match coll {
                Some(coll) => select(d, &self.scope(coll, placement, hide_orphans), selector, false),
                None => Ok(Vec::new()),
            });
        }
        let placement = self.placement_for(ns, ctx)?;
        let Some(coll) = self.collection_for_read(ns, &placement)? else {
            return Ok(Vec::new());
        };
        let txn = self.store().begin(true)?;
        select(&txn, &self.scope(&coll, &placement, hide_orphans), selector, false)
    }

    pub fn count(&self, ns: &Namespace, selector: &Selector, ctx: &OpContext) -> Result<u64, ShardError> {
        Ok(self.find(ns, selector, ctx)?.len() as u64)
    }

    /// Documents stored for `ns` that this shard does not own.
    pub fn orphan_count(&self, ns: &Namespace) -> Result<u64, ShardError> {
        let placement = self.current_placement(ns)?;
        let Some(coll) = self.collection_for_read(ns, &placement)? else {
            return Ok(0);
        };
        let scope = self.scope(&coll, &placement, true);
        let txn = self.store().begin(true)?;
        Ok(txn
            .all_docs(&coll)?
            .iter()
            .filter(|d| !scope.owns(d))
            .count() as u64)
    }
}

