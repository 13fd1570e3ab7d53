use clap::Parser;
use soulgraph::{Config, Server};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a soulgraph node", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON); SOULGRAPH_* variables override it
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    info!("Starting soulgraph node {}", config.server.name);

    let server = Server::open(config)?;
    info!(
        "Serving on {} with {} peers",
        server.config().server.http_addr,
        server.federation().peers().len()
    );

    server.start().await?;
    Ok(())
}
