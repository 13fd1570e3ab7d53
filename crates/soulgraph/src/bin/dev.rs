use clap::Parser;
use soulgraph::{Config, Server};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run multiple soulgraph nodes locally for development", long_about = None)]
struct Args {
    /// Number of nodes to start
    #[arg(short, long, default_value = "3")]
    nodes: u16,

    /// HTTP port of the first node; the others follow consecutively
    #[arg(short, long, default_value = "8765")]
    port: u16,

    /// Data directory root (each node gets a subdirectory)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

struct NodeSetup {
    config: Config,
    _temp_dir: Option<TempDir>, // Keep alive to prevent cleanup
}

fn node_url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

fn write_peers(path: &Path, peers: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::write(path, serde_yaml::to_string(peers)?)?;
    Ok(())
}

fn generate_node_configs(
    num_nodes: u16,
    first_port: u16,
    data_dir: Option<PathBuf>,
) -> Result<Vec<NodeSetup>, Box<dyn std::error::Error>> {
    let ports: Vec<u16> = (0..num_nodes).map(|i| first_port + i).collect();
    let mut setups = Vec::new();

    for (index, port) in ports.iter().enumerate() {
        let (node_dir, temp_dir) = match &data_dir {
            Some(base_dir) => {
                let dir = base_dir.join(format!("{}", index + 1));
                std::fs::create_dir_all(&dir)?;
                (dir, None)
            }
            None => {
                let temp_dir = TempDir::new()?;
                (temp_dir.path().to_path_buf(), Some(temp_dir))
            }
        };

        let peers: Vec<String> = ports.iter().filter(|p| *p != port).map(|p| node_url(*p)).collect();
        let peers_file = node_dir.join("peers.yaml");
        write_peers(&peers_file, &peers)?;

        let mut config = Config::default();
        config.server.name = format!("node-{}", index + 1);
        config.server.http_addr = format!("127.0.0.1:{}", port);
        config.server.db_path = node_dir.join("node.db");
        config.federation.peers_file = peers_file;

        setups.push(NodeSetup {
            config,
            _temp_dir: temp_dir,
        });
    }

    Ok(setups)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if args.nodes == 0 {
        eprintln!("Error: Number of nodes must be at least 1");
        std::process::exit(1);
    }

    info!("Starting {}-node local cluster...", args.nodes);
    let node_setups = generate_node_configs(args.nodes, args.port, args.data_dir)?;

    for setup in &node_setups {
        info!(
            "{}: HTTP={}, DB={:?}",
            setup.config.server.name, setup.config.server.http_addr, setup.config.server.db_path
        );
    }

    let mut tasks = Vec::new();
    for setup in &node_setups {
        let config = setup.config.clone();
        let name = config.server.name.clone();

        tasks.push(tokio::spawn(async move {
            let server = match Server::open(config) {
                Ok(server) => server,
                Err(e) => {
                    error!("Failed to create {}: {}", name, e);
                    return;
                }
            };

            if let Err(e) = server.start().await {
                error!("{} error: {}", name, e);
            }
        }));
    }

    // Keep node_setups alive to prevent temp directories from being deleted
    let _keep_alive = node_setups;

    info!("All nodes started. Press Ctrl+C to stop.");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            for task in tasks {
                if let Err(e) = task.await {
                    error!("Task error: {}", e);
                }
            }
        } => {
            info!("All tasks completed");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
