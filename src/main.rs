use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use hpc_agent::config::{AgentConfig, EndpointStore, Endpoints};
use hpc_agent::executor::RemoteExecutor;
use hpc_agent::monitor::NodeMonitor;
use hpc_agent::naming::ServiceResolver;
use hpc_agent::server;
use hpc_agent::shutdown::install_shutdown_handler;
use hpc_agent::system::UnixSystem;

#[derive(Parser, Debug)]
#[command(name = "hpc-agent")]
#[command(about = "Per-node execution agent for an HPC cluster")]
struct Args {
    /// Port the remote-call front-end listens on
    #[arg(long, default_value = "40000")]
    port: u16,

    /// Naming service base URLs (comma-separated)
    #[arg(long, default_value = "")]
    naming: String,

    /// Cluster network name reported during registration
    #[arg(long, default_value = "")]
    network_name: String,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "30")]
    heartbeat_interval: u64,

    /// Metric interval in seconds
    #[arg(long, default_value = "60")]
    metric_interval: u64,

    /// Hosts file fetch interval in seconds
    #[arg(long, default_value = "120")]
    hosts_fetch_interval: u64,

    /// Local hosts file rewritten by the hosts manager
    #[arg(long, default_value = "/etc/hosts")]
    hosts_file: PathBuf,

    /// Cgroup filesystem root
    #[arg(long, default_value = "/sys/fs/cgroup")]
    cgroup_root: PathBuf,

    /// Directory holding the MPI container helper scripts
    #[arg(long, default_value = "/opt/hpcagent")]
    script_dir: PathBuf,

    /// File persisting head-service endpoints across restarts
    #[arg(long)]
    endpoints_file: Option<PathBuf>,

    /// Initial heartbeat URI (normally learned via Ping)
    #[arg(long, default_value = "")]
    heartbeat_uri: String,

    /// Initial register URI
    #[arg(long, default_value = "")]
    register_uri: String,

    /// Hosts file document URI
    #[arg(long, default_value = "")]
    hosts_file_uri: String,

    /// Enable diagnostic dumps for undead processes
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let naming_endpoints: Vec<String> = args
        .naming
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let config = Arc::new(AgentConfig {
        listen_addr: SocketAddr::new("0.0.0.0".parse()?, args.port),
        network_name: args.network_name,
        naming_endpoints: naming_endpoints.clone(),
        heartbeat_interval_secs: args.heartbeat_interval,
        metric_interval_secs: args.metric_interval,
        hosts_fetch_interval_secs: args.hosts_fetch_interval,
        hosts_file_path: args.hosts_file,
        cgroup_root: args.cgroup_root,
        script_dir: args.script_dir.clone(),
        endpoints_file: args.endpoints_file.clone(),
        debug: args.debug,
        ..AgentConfig::default()
    });

    let endpoints = Arc::new(EndpointStore::load(
        Endpoints {
            heartbeat_uri: args.heartbeat_uri,
            register_uri: args.register_uri,
            hosts_file_uri: args.hosts_file_uri,
            ..Endpoints::default()
        },
        args.endpoints_file,
    ));

    let client = reqwest::Client::new();
    let resolver = Arc::new(ServiceResolver::new(
        naming_endpoints,
        Duration::from_secs(config.naming_backoff_secs),
        client.clone(),
    ));
    let monitor = Arc::new(NodeMonitor::new(config.network_name.clone()));
    let system = Arc::new(UnixSystem::new(args.script_dir));

    let cancel = install_shutdown_handler();
    let executor = RemoteExecutor::new(
        config.clone(),
        endpoints,
        resolver,
        system,
        monitor.clone(),
        client,
        cancel.clone(),
    );

    tracing::info!(
        node = monitor.node_name(),
        listen_addr = %config.listen_addr,
        "Starting hpc-agent"
    );

    executor.start().await;
    server::serve(config.listen_addr, executor.clone(), cancel).await?;

    executor.shutdown().await;
    Ok(())
}
