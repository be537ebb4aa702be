use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use graphd_core::graph::GraphRegistry;

#[derive(Debug, Parser)]
#[command(name = "graphd-server")]
struct Args {
    #[arg(long, default_value = "config/graphd.yaml")]
    config: PathBuf,
    /// Overrides server.listen from the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    graphd_runtime::init_tracing();
    let args = Args::parse();

    let mut registry = GraphRegistry::new();
    graphd_server::fill_registry_with_builtin(&mut registry, &args.config)?;

    graphd_server::run_server(args.config, args.listen, registry).await
}
