//! TCP front end for a [`tessera_cluster::Cluster`].

pub mod protocol;
mod server;
mod session;

pub use server::Server;
pub use session::Session;
