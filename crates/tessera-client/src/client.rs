use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};

use bson::Document;
use tessera_routing::ErrorCode;
use tessera_server::protocol::{
    CommandOptions, ErrorReply, FrameError, Request, Response, read_frame, write_frame,
};
use tessera_shard::{
    DeleteResult, FailPointMode, FindAndModify, FindAndModifyResult, InsertResult, Selector,
    SessionInfo, UpdateResult, UpdateSpec,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("server error {}({}): {}", .0.code_name, .0.code, .0.message)]
    Server(ErrorReply),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("connection pool: {0}")]
    Pool(String),
}

impl ClientError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Server(reply) => reply.error_code().unwrap_or(ErrorCode::InternalError),
            _ => ErrorCode::InternalError,
        }
    }

    /// Whether the server marked the failure as safe to resend.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Server(reply) if reply.retryable)
    }
}

/// One page of change events from a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub events: Vec<Document>,
    pub resume_token: Option<String>,
    /// The stream was invalidated; the cursor no longer exists.
    pub closed: bool,
}

pub struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    /// Set once the stream fails mid-request; the framing is lost after that.
    broken: bool,
}

impl Client {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);
        Ok(Self {
            reader,
            writer,
            broken: false,
        })
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn request(&mut self, request: Request) -> Result<Response, ClientError> {
        let reply = write_frame(&mut self.writer, &request)
            .and_then(|()| read_frame::<_, Response>(&mut self.reader));
        match reply {
            Ok(Some(Response::Error(reply))) => Err(ClientError::Server(reply)),
            Ok(Some(response)) => Ok(response),
            Ok(None) => {
                self.broken = true;
                Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )))
            }
            Err(e) => {
                self.broken = true;
                Err(e.into())
            }
        }
    }

    fn expect_ok(&mut self, request: Request) -> Result<(), ClientError> {
        match self.request(request)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn expect_document(&mut self, request: Request) -> Result<Document, ClientError> {
        match self.request(request)? {
            Response::Document(d) => Ok(d),
            other => Err(unexpected(other)),
        }
    }

    fn expect_documents(&mut self, request: Request) -> Result<Vec<Document>, ClientError> {
        match self.request(request)? {
            Response::Documents(d) => Ok(d),
            other => Err(unexpected(other)),
        }
    }

    fn expect_count(&mut self, request: Request) -> Result<u64, ClientError> {
        match self.request(request)? {
            Response::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    // ── Writes ──────────────────────────────────────────────────

    pub fn insert(
        &mut self,
        ns: &str,
        docs: Vec<Document>,
        options: &CommandOptions,
    ) -> Result<InsertResult, ClientError> {
        match self.request(Request::Insert {
            ns: ns.to_string(),
            docs,
            options: options.clone(),
        })? {
            Response::Insert(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    pub fn update(
        &mut self,
        ns: &str,
        selector: Selector,
        update: UpdateSpec,
        multi: bool,
        upsert: bool,
        options: &CommandOptions,
    ) -> Result<UpdateResult, ClientError> {
        match self.request(Request::Update {
            ns: ns.to_string(),
            selector,
            update,
            multi,
            upsert,
            options: options.clone(),
        })? {
            Response::Update(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    pub fn delete(
        &mut self,
        ns: &str,
        selector: Selector,
        multi: bool,
        options: &CommandOptions,
    ) -> Result<DeleteResult, ClientError> {
        match self.request(Request::Delete {
            ns: ns.to_string(),
            selector,
            multi,
            options: options.clone(),
        })? {
            Response::Delete(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    pub fn find_and_modify(
        &mut self,
        ns: &str,
        request: FindAndModify,
        options: &CommandOptions,
    ) -> Result<FindAndModifyResult, ClientError> {
        match self.request(Request::FindAndModify {
            ns: ns.to_string(),
            request,
            options: options.clone(),
        })? {
            Response::FindAndModify(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    // ── Reads ───────────────────────────────────────────────────

    pub fn find(
        &mut self,
        ns: &str,
        selector: Selector,
        options: &CommandOptions,
    ) -> Result<Vec<Document>, ClientError> {
        self.expect_documents(Request::Find {
            ns: ns.to_string(),
            selector,
            options: options.clone(),
        })
    }

    pub fn count(
        &mut self,
        ns: &str,
        selector: Selector,
        options: &CommandOptions,
    ) -> Result<u64, ClientError> {
        self.expect_count(Request::Count {
            ns: ns.to_string(),
            selector,
            options: options.clone(),
        })
    }

    // ── Transactions ────────────────────────────────────────────

    pub fn commit_transaction(&mut self, session: SessionInfo) -> Result<(), ClientError> {
        self.expect_ok(Request::CommitTransaction { session })
    }

    pub fn abort_transaction(&mut self, session: SessionInfo) -> Result<(), ClientError> {
        self.expect_ok(Request::AbortTransaction { session })
    }

    // ── Sharding ────────────────────────────────────────────────

    /// Shard `ns` on `key` (e.g. `{region: 1}`). Returns the collection
    /// metadata document.
    pub fn shard_collection(
        &mut self,
        ns: &str,
        key: Document,
        unique: bool,
        split_points: Vec<Document>,
    ) -> Result<Document, ClientError> {
        self.expect_document(Request::ShardCollection {
            ns: ns.to_string(),
            key,
            unique,
            split_points,
        })
    }

    pub fn split_chunk(&mut self, ns: &str, at: Document) -> Result<Vec<Document>, ClientError> {
        self.expect_documents(Request::SplitChunk {
            ns: ns.to_string(),
            at,
        })
    }

    pub fn merge_chunks(
        &mut self,
        ns: &str,
        min: Option<Document>,
        max: Option<Document>,
    ) -> Result<Document, ClientError> {
        self.expect_document(Request::MergeChunks {
            ns: ns.to_string(),
            min,
            max,
        })
    }

    /// Move `[min, max)` to shard `to`. `None` bounds are MinKey/MaxKey.
    pub fn move_range(
        &mut self,
        ns: &str,
        min: Option<Document>,
        max: Option<Document>,
        to: &str,
    ) -> Result<Document, ClientError> {
        self.expect_document(Request::MoveRange {
            ns: ns.to_string(),
            min,
            max,
            to: to.to_string(),
        })
    }

    pub fn reshard_collection(
        &mut self,
        ns: &str,
        key: Document,
        split_points: Vec<Document>,
    ) -> Result<Document, ClientError> {
        self.expect_document(Request::ReshardCollection {
            ns: ns.to_string(),
            key,
            split_points,
        })
    }

    pub fn abort_reshard_collection(&mut self, ns: &str) -> Result<(), ClientError> {
        self.expect_ok(Request::AbortReshardCollection { ns: ns.to_string() })
    }

    pub fn cleanup_orphaned(&mut self, ns: &str) -> Result<u64, ClientError> {
        self.expect_count(Request::CleanupOrphaned { ns: ns.to_string() })
    }

    pub fn drop_collection(&mut self, ns: &str) -> Result<bool, ClientError> {
        match self.request(Request::DropCollection { ns: ns.to_string() })? {
            Response::Dropped(existed) => Ok(existed),
            other => Err(unexpected(other)),
        }
    }

    pub fn list_chunks(&mut self, ns: &str) -> Result<Vec<Document>, ClientError> {
        self.expect_documents(Request::ListChunks { ns: ns.to_string() })
    }

    // ── Change streams ──────────────────────────────────────────

    /// Open a change stream cursor on `ns`.
    pub fn watch(&mut self, ns: &str, resume_after: Option<&str>) -> Result<u64, ClientError> {
        match self.request(Request::Watch {
            ns: ns.to_string(),
            resume_after: resume_after.map(str::to_string),
        })? {
            Response::Cursor(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// Next events of `cursor`, waiting up to `max_wait_ms` for the first.
    pub fn get_more(&mut self, cursor: u64, max_wait_ms: u64) -> Result<EventBatch, ClientError> {
        match self.request(Request::GetMore {
            cursor,
            max_wait_ms,
        })? {
            Response::Events {
                events,
                resume_token,
                closed,
            } => Ok(EventBatch {
                events,
                resume_token,
                closed,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub fn kill_cursor(&mut self, cursor: u64) -> Result<(), ClientError> {
        self.expect_ok(Request::KillCursor { cursor })
    }

    // ── Testing ─────────────────────────────────────────────────

    pub fn configure_failpoint(
        &mut self,
        name: &str,
        mode: FailPointMode,
        data: Option<Document>,
    ) -> Result<(), ClientError> {
        self.expect_ok(Request::ConfigureFailPoint {
            name: name.to_string(),
            mode,
            data,
        })
    }
}

fn unexpected(response: Response) -> ClientError {
    ClientError::UnexpectedResponse(format!("{response:?}"))
}
