//! Shard-key space, chunk ownership and the versioned routing metadata shared
//! by routers, shards and the config server.

mod cache;
mod chunk;
mod error;
mod key;
mod namespace;
mod table;
mod version;

pub use cache::{CatalogCache, CollectionEntry, RoutingInfo, RoutingSource};
pub use chunk::{Chunk, ChunkRange, CollectionMetadata};
pub use error::{ErrorCategory, ErrorCode, KeyError, RoutingError};
pub use key::{KeyPattern, KeyValue, ShardKey, encode_value};
pub use namespace::{CollectionUuid, Namespace, ShardId};
pub use table::{RoutingTable, validate_partition};
pub use version::{ChunkVersion, Epoch, ShardVersion};
