use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use tessera_cluster::{ChangeStream, Cluster, ClusterError, RequestOptions, ResumeToken};
use tessera_routing::{ChunkRange, KeyPattern, Namespace, RoutingError, ShardId, ShardKey};
use tracing::debug;

use crate::protocol::{CommandOptions, ErrorReply, Request, Response};

/// Events returned by one `GetMore` at most.
const BATCH_LIMIT: usize = 1_000;

impl From<CommandOptions> for RequestOptions {
    fn from(o: CommandOptions) -> Self {
        RequestOptions {
            session: o.session,
            stmt_id: o.stmt_id,
            in_transaction: o.in_transaction,
            expected_uuid: o.expected_uuid,
        }
    }
}

/// One client connection. Change-stream cursors live as long as the
/// connection that opened them.
pub struct Session {
    cluster: Arc<Cluster>,
    cursors: HashMap<u64, ChangeStream>,
    next_cursor: u64,
}

impl Session {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            cursors: HashMap::new(),
            next_cursor: 1,
        }
    }

    pub fn handle(&mut self, request: Request) -> Response {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                debug!(code = %e.code(), error = %e, "command failed");
                Response::Error(ErrorReply::new(e.code(), e.to_string()))
            }
        }
    }

    fn dispatch(&mut self, request: Request) -> Result<Response, ClusterError> {
        let router = self.cluster.router();
        Ok(match request {
            Request::Insert { ns, docs, options } => {
                Response::Insert(router.insert(&parse_ns(&ns)?, docs, &options.into())?)
            }
            Request::Update {
                ns,
                selector,
                update,
                multi,
                upsert,
                options,
            } => Response::Update(router.update(
                &parse_ns(&ns)?,
                &selector,
                &update,
                multi,
                upsert,
                &options.into(),
            )?),
            Request::Delete {
                ns,
                selector,
                multi,
                options,
            } => Response::Delete(router.delete(&parse_ns(&ns)?, &selector, multi, &options.into())?),
            Request::Find { ns, selector, options } => {
                Response::Documents(router.find(&parse_ns(&ns)?, &selector, &options.into())?)
            }
            Request::Count { ns, selector, options } => {
                Response::Count(router.count(&parse_ns(&ns)?, &selector, &options.into())?)
            }
            Request::FindAndModify { ns, request, options } => Response::FindAndModify(
                router.find_and_modify(&parse_ns(&ns)?, &request, &options.into())?,
            ),
            Request::CommitTransaction { session } => {
                router.commit_transaction(session)?;
                Response::Ok
            }
            Request::AbortTransaction { session } => {
                router.abort_transaction(session)?;
                Response::Ok
            }

            Request::ShardCollection {
                ns,
                key,
                unique,
                split_points,
            } => {
                let pattern = parse_pattern(&key)?;
                let points = keys(&pattern, &split_points)?;
                let meta = self
                    .cluster
                    .shard_collection(&parse_ns(&ns)?, pattern, unique, &points)?;
                Response::Document(metadata_document(&meta))
            }
            Request::SplitChunk { ns, at } => {
                let ns = parse_ns(&ns)?;
                let pattern = self.key_pattern(&ns)?;
                let (left, right) = self.cluster.split_chunk(&ns, &key_of(&pattern, &at)?)?;
                Response::Documents(vec![
                    left.to_document(&ns, &pattern),
                    right.to_document(&ns, &pattern),
                ])
            }
            Request::MergeChunks { ns, min, max } => {
                let ns = parse_ns(&ns)?;
                let pattern = self.key_pattern(&ns)?;
                let range = range_of(&pattern, min.as_ref(), max.as_ref())?;
                let merged = self.cluster.merge_chunks(&ns, &range)?;
                Response::Document(merged.to_document(&ns, &pattern))
            }
            Request::MoveRange { ns, min, max, to } => {
                let ns = parse_ns(&ns)?;
                let pattern = self.key_pattern(&ns)?;
                let range = range_of(&pattern, min.as_ref(), max.as_ref())?;
                let outcome = self.cluster.move_range(&ns, &range, &ShardId::new(to))?;
                Response::Document(bson::doc! {
                    "from": outcome.from.as_str(),
                    "to": outcome.to.as_str(),
                    "version": outcome.version.to_string(),
                    "cloned": outcome.cloned as i64,
                    "caughtUp": outcome.caught_up as i64,
                })
            }
            Request::ReshardCollection {
                ns,
                key,
                split_points,
            } => {
                let pattern = parse_pattern(&key)?;
                let points = keys(&pattern, &split_points)?;
                let meta = self
                    .cluster
                    .reshard_collection(&parse_ns(&ns)?, pattern, &points)?;
                Response::Document(metadata_document(&meta))
            }
            Request::AbortReshardCollection { ns } => {
                self.cluster.abort_reshard_collection(&parse_ns(&ns)?)?;
                Response::Ok
            }
            Request::CleanupOrphaned { ns } => {
                Response::Count(self.cluster.cleanup_orphaned(&parse_ns(&ns)?)?)
            }
            Request::DropCollection { ns } => {
                Response::Dropped(self.cluster.drop_collection(&parse_ns(&ns)?)?)
            }
            Request::ListChunks { ns } => {
                Response::Documents(self.cluster.chunk_documents(&parse_ns(&ns)?)?)
            }

            Request::Watch { ns, resume_after } => {
                let token = resume_after
                    .map(|t| t.parse::<ResumeToken>())
                    .transpose()?;
                let stream = self.cluster.open_change_stream(&parse_ns(&ns)?, token)?;
                let id = self.next_cursor;
                self.next_cursor += 1;
                self.cursors.insert(id, stream);
                Response::Cursor(id)
            }
            Request::GetMore { cursor, max_wait_ms } => self.get_more(cursor, max_wait_ms)?,
            Request::KillCursor { cursor } => {
                self.cursors.remove(&cursor);
                Response::Ok
            }

            Request::ConfigureFailPoint { name, mode, data } => {
                self.cluster.configure_failpoint(&name, mode, data);
                Response::Ok
            }
        })
    }

    fn get_more(&mut self, cursor: u64, max_wait_ms: u64) -> Result<Response, ClusterError> {
        let stream = self
            .cursors
            .get_mut(&cursor)
            .ok_or_else(|| ClusterError::BadValue(format!("cursor {cursor} not found")))?;
        let mut events = Vec::new();
        if let Some(first) = stream.next_timeout(Duration::from_millis(max_wait_ms))? {
            events.push(first.to_document());
            while events.len() < BATCH_LIMIT {
                match stream.try_next()? {
                    Some(event) => events.push(event.to_document()),
                    None => break,
                }
            }
        }
        let closed = stream.is_closed();
        let resume_token = stream.resume_token().map(|t| t.to_string());
        if closed {
            self.cursors.remove(&cursor);
        }
        Ok(Response::Events {
            events,
            resume_token,
            closed,
        })
    }

    fn key_pattern(&self, ns: &Namespace) -> Result<KeyPattern, ClusterError> {
        let info = self.cluster.routing_info(ns)?;
        let table = info
            .table()
            .ok_or_else(|| ClusterError::NotSharded(ns.to_string()))?;
        Ok(table.key_pattern().clone())
    }
}

fn parse_ns(ns: &str) -> Result<Namespace, ClusterError> {
    Ok(Namespace::parse(ns)?)
}

fn parse_pattern(key: &Document) -> Result<KeyPattern, ClusterError> {
    KeyPattern::from_document(key).map_err(|e| RoutingError::from(e).into())
}

fn key_of(pattern: &KeyPattern, doc: &Document) -> Result<ShardKey, ClusterError> {
    for field in pattern.fields() {
        if !doc.contains_key(field) {
            return Err(ClusterError::BadValue(format!(
                "{doc} does not name shard key field {field}"
            )));
        }
    }
    pattern.extract(doc).map_err(|e| RoutingError::from(e).into())
}

fn keys(pattern: &KeyPattern, docs: &[Document]) -> Result<Vec<ShardKey>, ClusterError> {
    docs.iter().map(|d| key_of(pattern, d)).collect()
}

fn range_of(
    pattern: &KeyPattern,
    min: Option<&Document>,
    max: Option<&Document>,
) -> Result<ChunkRange, ClusterError> {
    let min = match min {
        Some(d) => key_of(pattern, d)?,
        None => pattern.min_key(),
    };
    let max = match max {
        Some(d) => key_of(pattern, d)?,
        None => pattern.max_key(),
    };
    Ok(ChunkRange::new(min, max)?)
}

fn metadata_document(meta: &tessera_routing::CollectionMetadata) -> Document {
    bson::doc! {
        "ns": meta.namespace.to_string(),
        "uuid": meta.uuid.to_bson(),
        "epoch": meta.epoch.to_object_id(),
        "key": meta.key_pattern.to_document(),
        "unique": meta.unique,
        "allowMigrations": meta.allow_migrations,
    }
}
