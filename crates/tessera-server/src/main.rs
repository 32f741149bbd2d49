use std::path::PathBuf;
use std::sync::Arc;

use tessera_cluster::{Cluster, ClusterConfig};
use tessera_server::Server;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::var("TESSERA_ADDR").unwrap_or_else(|_| "0.0.0.0:9700".to_string());
    let mut config = ClusterConfig::default();
    if let Ok(shards) = std::env::var("TESSERA_SHARDS") {
        config.shards = shards
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Ok(dir) = std::env::var("TESSERA_DATA_DIR") {
        config.data_dir = Some(PathBuf::from(dir));
    }

    let cluster = Arc::new(Cluster::start(config)?);
    let server = Server::bind(cluster, &addr)?;
    server.serve()?;
    Ok(())
}
