mod client;
mod pool;

pub use client::{Client, ClientError, EventBatch};
pub use pool::{ClientPool, PooledClient};
pub use tessera_server::protocol::CommandOptions;
