use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use tessera_cluster::Cluster;
use tracing::{debug, info, warn};

use crate::protocol::{FrameError, Request, Response, read_frame, write_frame};
use crate::session::Session;

pub struct Server {
    cluster: Arc<Cluster>,
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bind `addr`. Port 0 picks a free port; see [`Server::local_addr`].
    pub fn bind(cluster: Arc<Cluster>, addr: &str) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            cluster,
            listener,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Flag that stops [`Server::serve`] once set. SIGTERM and SIGINT set it.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn serve(&self) -> Result<(), std::io::Error> {
        flag::register(SIGTERM, Arc::clone(&self.shutdown))?;
        flag::register(SIGINT, Arc::clone(&self.shutdown))?;
        info!(addr = %self.local_addr()?, "tessera-server listening");

        // Non-blocking accept, polled against the shutdown flag.
        self.listener.set_nonblocking(true)?;

        let connections: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    let read_half = stream.try_clone()?;
                    connections
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(read_half);

                    let cluster = Arc::clone(&self.cluster);
                    debug!(peer = %peer, "accepted connection");
                    handles.push(thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, cluster) {
                            warn!(peer = %peer, error = %e, "connection error");
                        }
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    warn!(error = %e, "accept error");
                }
            }
        }

        info!("shutdown signal received, draining connections");

        // Handlers blocked on their next request see end of stream.
        for stream in connections.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            let _ = stream.shutdown(Shutdown::Read);
        }

        for handle in handles {
            let _ = handle.join();
        }

        self.cluster.shutdown();
        info!("shutdown complete");
        Ok(())
    }
}

fn handle_connection(stream: TcpStream, cluster: Arc<Cluster>) -> Result<(), FrameError> {
    let mut session = Session::new(cluster);
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    // Client disconnected or the server is draining.
    while let Some(request) = read_frame::<_, Request>(&mut reader)? {
        let response: Response = session.handle(request);
        write_frame(&mut writer, &response)?;
    }
    Ok(())
}
