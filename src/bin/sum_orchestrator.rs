use std::sync::Arc;

use sum_rs::config::{parse_node_list, ConfigOverrides, OrchestratorConfig};
use sum_rs::service::{spawn_status_poller, OrchestratorService};
use sum_rs::Cluster;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"sum_orchestrator - sum cluster orchestrator

USAGE:
    sum_orchestrator [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to config file (TOML)
    -l, --listen <ADDR>     Override listen address [default: 127.0.0.1:50051]
    -n, --nodes <ADDRS>     Override node addresses (comma-separated)
        --nodes-file <F>    Topology snapshot (JSON), rewritten on membership changes
        --debug             Verbose logging
    -h, --help              Print help

ENVIRONMENT:
    SUM_CONFIG              Path to config file
    SUM_LISTEN              Listen address
    SUM_NODES_FILE          Topology snapshot
    SUM_TLS__CERT           Orchestrator certificate (PEM)
    SUM_TLS__KEY            Orchestrator private key (PEM)
    RUST_LOG                Log filter, overrides --debug

CONFIG FILE (sum.toml):
    listen = "0.0.0.0:50051"
    nodes_file = "/var/lib/sum/nodes.json"

    [[nodes]]
    address = "node-1:5000"
    credentials = "/etc/sum/node-1.pem"
"#
    );
}

fn server_tls(config: &OrchestratorConfig) -> anyhow::Result<Option<ServerTlsConfig>> {
    let (Some(cert), Some(key)) = (&config.tls.cert, &config.tls.key) else {
        return Ok(None);
    };
    let identity = Identity::from_pem(std::fs::read(cert)?, std::fs::read(key)?);
    let mut tls = ServerTlsConfig::new().identity(identity);
    if let Some(ca) = &config.tls.client_ca {
        tls = tls.client_ca_root(Certificate::from_pem(std::fs::read(ca)?));
    }
    Ok(Some(tls))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    let default_level = if has_flag("--debug") { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // Build CLI overrides
    let mut overrides = ConfigOverrides::default();
    if let Some(listen) = parse_arg("--listen").or_else(|| parse_arg("-l")) {
        overrides.listen = Some(listen.parse()?);
    }
    if let Some(nodes) = parse_arg("--nodes").or_else(|| parse_arg("-n")) {
        overrides.nodes = Some(parse_node_list(&nodes));
    }
    if let Some(nodes_file) = parse_arg("--nodes-file") {
        overrides.nodes_file = Some(nodes_file.into());
    }

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("SUM_CONFIG").ok());
    let config = OrchestratorConfig::load(config_path.as_deref(), overrides)?;

    let cluster = Arc::new(Cluster::from_config(&config).await?);
    let service = OrchestratorService::new(cluster.clone(), config.max_message_size);
    let poller = spawn_status_poller(cluster, config.poll_interval());

    let mut builder = Server::builder();
    if let Some(tls) = server_tls(&config)? {
        builder = builder.tls_config(tls)?;
    }

    tracing::info!(listen = %config.listen, "sum orchestrator listening");
    builder
        .add_service(service.data_server())
        .add_service(service.internal_server())
        .add_service(service.master_server())
        .serve_with_shutdown(config.listen, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    poller.abort();
    Ok(())
}
