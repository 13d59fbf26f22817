use anyhow::{Context, bail};
use site_agreement::config::ClusterConfig;
use site_agreement::coordination::client::HttpCoordinationStore;
use site_agreement::coordination::handlers::store_router;
use site_agreement::coordination::store::{CoordinationStore, InMemoryStore};
use site_agreement::node::handlers::status_router;
use site_agreement::node::listener::{LoggingListener, WatchListener};
use site_agreement::node::service::AgreementService;
use site_agreement::node::transport::UdpTransport;
use site_agreement::topology::publisher::TopologyPublisher;
use site_agreement::topology::types::TopologyEpoch;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} --config <path> [--store-host]", args[0]);
        eprintln!("Example: {} --config site1.toml --store-host", args[0]);
        eprintln!("Example: {} --config site2.toml", args[0]);

        std::process::exit(1);
    }

    let mut config_path: Option<PathBuf> = None;
    let mut store_host = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                let value = args.get(i + 1).context("--config needs a path")?;
                config_path = Some(PathBuf::from(value));
                i += 2;
            }
            "--store-host" => {
                store_host = true;
                i += 1;
            }
            _ => {
                i += 1;
            }
        }
    }

    let config_path = config_path.context("--config is required")?;
    let config = ClusterConfig::load(&config_path)?;
    let local = config.local_site;
    tracing::info!("Starting site {} with {} member(s)", local, config.sites.len());

    // 1. Coordination store:
    let hosted = store_host.then(|| Arc::new(InMemoryStore::new()));
    let store: Arc<dyn CoordinationStore> = match (&hosted, &config.store.url) {
        (Some(store), _) => {
            tracing::info!("Hosting the coordination store on {}", config.status_bind);
            store.clone() as Arc<dyn CoordinationStore>
        }
        (None, Some(url)) => Arc::new(HttpCoordinationStore::new(
            url,
            config.agreement.cas_timeout,
        )),
        (None, None) => bail!("no coordination store: pass --store-host or set store.url"),
    };
    let publisher = Arc::new(TopologyPublisher::new(
        store,
        &config.store.topology_key,
        &config.agreement,
    ));

    // 2. Topology bootstrap:
    let initial = TopologyEpoch::initial(config.members(), &config.partitions);
    let (topology, version) = publisher.bootstrap(initial).await?;
    if !topology.members.contains(&local) {
        bail!(
            "site {} is not a member of topology epoch {}",
            local,
            topology.epoch
        );
    }

    // 3. Gossip transport:
    let bind_addr = config
        .local_gossip_addr()
        .context("local site has no gossip address")?;
    let peers: BTreeMap<_, _> = config
        .sites
        .iter()
        .filter(|site| site.id != local)
        .map(|site| (site.id, site.gossip_addr))
        .collect();
    let transport = UdpTransport::bind(bind_addr, peers).await?;

    // 4. Agreement service:
    let (watch_listener, topology_rx) = WatchListener::new();
    let (mut service, handle) = AgreementService::new(
        local,
        config.agreement.clone(),
        topology,
        version,
        transport.clone(),
        publisher,
    );
    service.add_listener(Arc::new(LoggingListener::new(local)));
    service.add_listener(Arc::new(watch_listener));
    let _receiver = transport.spawn_receiver(handle.clone());

    // 5. HTTP endpoints:
    let mut app = status_router(handle, topology_rx);
    if let Some(store) = hosted {
        app = app.merge(store_router(store));
    }

    let listener = tokio::net::TcpListener::bind(config.status_bind).await?;
    tracing::info!("HTTP server listening on {}", config.status_bind);
    tracing::info!("Press Ctrl+C to shutdown");

    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    // 6. Run until agreement stops:
    let fatal = service.run().await;
    server.abort();
    bail!("agreement stopped: {}", fatal)
}
