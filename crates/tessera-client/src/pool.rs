use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::client::{Client, ClientError};

/// Fixed set of connections to one server, lent out one caller at a time.
///
/// A connection that failed mid-request is replaced by a fresh one the next
/// time it is checked out.
pub struct ClientPool {
    addrs: Vec<SocketAddr>,
    idle: Sender<Client>,
    waiting: Receiver<Client>,
}

impl ClientPool {
    pub fn new(addr: impl ToSocketAddrs, size: usize) -> Result<Self, ClientError> {
        let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
        let (idle, waiting) = crossbeam::channel::bounded(size);
        for _ in 0..size {
            idle.send(Client::connect(&addrs[..])?)
                .map_err(|e| ClientError::Pool(e.to_string()))?;
        }
        Ok(Self {
            addrs,
            idle,
            waiting,
        })
    }

    /// Wait for a free connection.
    pub fn get(&self) -> Result<PooledClient<'_>, ClientError> {
        let client = self
            .waiting
            .recv()
            .map_err(|e| ClientError::Pool(e.to_string()))?;
        self.check_out(client)
    }

    /// Wait at most `timeout` for a free connection.
    pub fn get_timeout(&self, timeout: Duration) -> Result<PooledClient<'_>, ClientError> {
        match self.waiting.recv_timeout(timeout) {
            Ok(client) => self.check_out(client),
            Err(RecvTimeoutError::Timeout) => {
                Err(ClientError::Pool(format!("no connection free after {timeout:?}")))
            }
            Err(e) => Err(ClientError::Pool(e.to_string())),
        }
    }

    /// Connections not currently on loan.
    pub fn available(&self) -> usize {
        self.waiting.len()
    }

    fn check_out(&self, client: Client) -> Result<PooledClient<'_>, ClientError> {
        let client = if client.is_broken() {
            match Client::connect(&self.addrs[..]) {
                Ok(fresh) => fresh,
                Err(e) => {
                    // Keep the slot so the pool does not shrink.
                    let _ = self.idle.send(client);
                    return Err(e);
                }
            }
        } else {
            client
        };
        Ok(PooledClient {
            client: Some(client),
            pool: &self.idle,
        })
    }
}

/// A connection on loan from a [`ClientPool`]; returned on drop.
pub struct PooledClient<'a> {
    client: Option<Client>,
    pool: &'a Sender<Client>,
}

impl Deref for PooledClient<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        // Only `drop` takes the client out.
        self.client.as_ref().expect("pooled client present until drop")
    }
}

impl DerefMut for PooledClient<'_> {
    fn deref_mut(&mut self) -> &mut Client {
        self.client.as_mut().expect("pooled client present until drop")
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = self.pool.send(client);
        }
    }
}
