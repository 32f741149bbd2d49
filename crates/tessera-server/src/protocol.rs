//! Wire types and framing.
//!
//! Every message is a big-endian `u32` length followed by that many bytes
//! of MessagePack. One request gets exactly one response.

use std::io::{self, Read, Write};

use bson::Document;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tessera_routing::{CollectionUuid, ErrorCode};
use tessera_shard::{
    DeleteResult, FailPointMode, FindAndModify, FindAndModifyResult, InsertResult, Selector,
    SessionInfo, UpdateResult, UpdateSpec,
};
use thiserror::Error;

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 48 * 1024 * 1024;

/// Session and transaction fields carried by data commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOptions {
    pub session: Option<SessionInfo>,
    pub stmt_id: Option<i32>,
    pub in_transaction: bool,
    pub expected_uuid: Option<CollectionUuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    // ── Data ──
    Insert {
        ns: String,
        docs: Vec<Document>,
        options: CommandOptions,
    },
    Update {
        ns: String,
        selector: Selector,
        update: UpdateSpec,
        multi: bool,
        upsert: bool,
        options: CommandOptions,
    },
    Delete {
        ns: String,
        selector: Selector,
        multi: bool,
        options: CommandOptions,
    },
    Find {
        ns: String,
        selector: Selector,
        options: CommandOptions,
    },
    Count {
        ns: String,
        selector: Selector,
        options: CommandOptions,
    },
    FindAndModify {
        ns: String,
        request: FindAndModify,
        options: CommandOptions,
    },
    CommitTransaction {
        session: SessionInfo,
    },
    AbortTransaction {
        session: SessionInfo,
    },

    // ── Sharding ──
    /// `key` is a key pattern document such as `{region: 1}`; split points
    /// are documents over the key fields.
    ShardCollection {
        ns: String,
        key: Document,
        unique: bool,
        split_points: Vec<Document>,
    },
    SplitChunk {
        ns: String,
        at: Document,
    },
    /// `None` bounds stand for MinKey and MaxKey.
    MergeChunks {
        ns: String,
        min: Option<Document>,
        max: Option<Document>,
    },
    MoveRange {
        ns: String,
        min: Option<Document>,
        max: Option<Document>,
        to: String,
    },
    ReshardCollection {
        ns: String,
        key: Document,
        split_points: Vec<Document>,
    },
    AbortReshardCollection {
        ns: String,
    },
    CleanupOrphaned {
        ns: String,
    },
    DropCollection {
        ns: String,
    },
    ListChunks {
        ns: String,
    },

    // ── Change streams ──
    Watch {
        ns: String,
        resume_after: Option<String>,
    },
    GetMore {
        cursor: u64,
        max_wait_ms: u64,
    },
    KillCursor {
        cursor: u64,
    },

    // ── Testing ──
    ConfigureFailPoint {
        name: String,
        mode: FailPointMode,
        data: Option<Document>,
    },
}

/// Error reply. `retryable` tells the client whether resending the same
/// request may succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: i32,
    pub code_name: String,
    pub message: String,
    pub retryable: bool,
}

impl ErrorReply {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_i32(),
            code_name: code.name().to_string(),
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_i32(self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Insert(InsertResult),
    Update(UpdateResult),
    Delete(DeleteResult),
    Documents(Vec<Document>),
    Count(u64),
    FindAndModify(FindAndModifyResult),
    /// Collection metadata or a single chunk, as a document.
    Document(Document),
    Dropped(bool),
    Cursor(u64),
    Events {
        events: Vec<Document>,
        resume_token: Option<String>,
        closed: bool,
    },
    Error(ErrorReply),
}

// ── Framing ─────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),
}

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), FrameError> {
    let bytes = rmp_serde::to_vec(message)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean end of stream before any byte of
/// the length prefix.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(Some(rmp_serde::from_slice(&buf)?))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bson::doc;

    use super::*;

    #[test]
    fn frames_carry_one_message_each() {
        let mut buf = Vec::new();
        let first = Request::Count {
            ns: "shop.orders".into(),
            selector: Selector::Eq(doc! { "region": "east" }),
            options: CommandOptions::default(),
        };
        let second = Request::KillCursor { cursor: 7 };
        write_frame(&mut buf, &first).unwrap();
        write_frame(&mut buf, &second).unwrap();

        let mut reader = Cursor::new(buf);
        assert_eq!(read_frame::<_, Request>(&mut reader).unwrap(), Some(first));
        assert_eq!(read_frame::<_, Request>(&mut reader).unwrap(), Some(second));
        assert_eq!(read_frame::<_, Request>(&mut reader).unwrap(), None);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut reader = Cursor::new(u32::MAX.to_be_bytes().to_vec());
        let err = read_frame::<_, Response>(&mut reader).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[test]
    fn error_replies_carry_code_name_and_retryability() {
        let reply = ErrorReply::new(ErrorCode::StaleConfig, "stale");
        assert_eq!(reply.code, 13388);
        assert_eq!(reply.code_name, "StaleConfig");
        assert!(reply.retryable);
        assert_eq!(reply.error_code(), Some(ErrorCode::StaleConfig));

        let reply = ErrorReply::new(ErrorCode::DuplicateKey, "dup");
        assert!(!reply.retryable);
    }
}
