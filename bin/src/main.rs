#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use ember_core::{
    allocator::{Allocator, Pool},
    config::{
        cli::{self, Parser},
        trace,
    },
    handler::Handler,
    server::subnets::{Subnet, SubnetTable},
    sweeper::ExpirySweeper,
    tokio::{self, runtime::Builder, signal, task::JoinHandle},
    tracing::*,
    Server,
};
use event_bus::Broadcaster;
use gitops::{Poller, ReloadFn, RepoConfig, Repository, SyncService};
use lease_store::{LeaseCache, PgStore, StoreConfig};
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    // parses from cli or environment var
    let cli_cfg = cli::Config::parse();
    let cfg = config::Config::parse(&cli_cfg.config_path)?;
    trace::Config::init(&cli_cfg.ember_log, &cfg.observability.log_format)?;
    debug!(?cli_cfg, "parsed configuration");
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    builder.thread_name(&cli_cfg.thread_name).enable_all();
    // default worker count is the logical CPU count
    if let Some(num) = cli_cfg.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(cli_cfg, cfg).await }).await {
            Err(err) => error!(?err, "failed to start server"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(cli_cfg: cli::Config, cfg: config::Config) -> Result<()> {
    let server_id = cfg.server.server_id.clone();
    info!(?server_id, "using server identity");

    // configured interfaces are advisory on the 0.0.0.0 listener; flag typos
    let host_interfaces = ember_core::pnet::datalink::interfaces();
    for iface in &cfg.server.interfaces {
        if !host_interfaces.iter().any(|i| i.name == iface.name) {
            warn!(name = %iface.name, "configured interface not found on this host");
        }
    }

    info!("connecting to database");
    let store = Arc::new(
        PgStore::connect(StoreConfig {
            connection: cfg.database.connection.clone(),
            max_connections: cfg.database.max_connections,
            min_connections: cfg.database.min_connections,
            connect_timeout: Duration::from_secs(10),
        })
        .await?,
    );
    store
        .health()
        .await
        .context("database health check failed")?;
    info!("database connection established");

    let token = CancellationToken::new();
    let events = Broadcaster::start(token.clone());

    let cache = LeaseCache::default();
    let allocator = Allocator::new(Arc::clone(&store), Some(cache.clone()), server_id);
    let subnets = SubnetTable::new(runtime_subnets(&cfg));
    let handler = Arc::new(Handler::new(
        Arc::clone(&store),
        allocator,
        subnets.clone(),
        events.clone(),
    ));
    let server = Arc::new(Server::new(cli_cfg.v4_addr, subnets, handler));

    let sweeper = ExpirySweeper::new(Arc::clone(&store), Some(events.clone()), Some(cache));
    let sweeper_task: JoinHandle<()> = {
        let token = token.clone();
        tokio::spawn(async move { sweeper.run(token).await })
    };

    let poller_task: Option<JoinHandle<()>> = if cfg.git.enabled {
        info!(
            repository = %cfg.git.repository,
            branch = %cfg.git.branch,
            "initializing GitOps"
        );
        let repo = Arc::new(Repository::new(RepoConfig {
            url: cfg.git.repository.clone(),
            branch: cfg.git.branch.clone(),
            local_path: std::env::temp_dir().join("ember-git"),
            auth: cfg.git.auth.clone(),
            config_path: cfg.git.config_path.clone(),
        }));
        {
            let repo = Arc::clone(&repo);
            tokio::task::spawn_blocking(move || repo.initialize())
                .await
                .map_err(|err| anyhow!(err))?
                .context("failed to initialize config repository")?;
        }

        // the reload callback swaps the server's subnet table; reservation
        // changes were already applied to the store by the sync service
        let reload: ReloadFn = {
            let server = Arc::clone(&server);
            Arc::new(move |new_cfg: &config::Config| {
                server.reload_subnets(runtime_subnets(new_cfg));
                Ok(())
            })
        };
        let sync = Arc::new(SyncService::new(
            repo,
            Arc::clone(&store),
            Some(reload),
            Some(events.clone()),
            cfg.git.sync_timeout,
        ));
        let poller = Poller::new(sync, cfg.git.poll_interval);
        let token = token.clone();
        Some(tokio::spawn(async move { poller.run(token).await }))
    } else {
        info!("GitOps disabled, syncing reservations from local config");
        if let Err(err) = gitops::sync_local_reservations(store.as_ref(), &cfg).await {
            warn!(?err, "failed to sync reservations from local config");
        }
        None
    };

    let mut server_task = {
        let server = Arc::clone(&server);
        let token = token.clone();
        tokio::spawn(async move { server.run(token).await })
    };

    tokio::select! {
        res = &mut server_task => {
            token.cancel();
            flatten_join(res)?;
        }
        sig = signal::ctrl_c() => {
            sig.map_err(|err| anyhow!(err))?;
            info!("caught shutdown signal");
            token.cancel();
            // the server drains its workers within the grace period
            flatten_join(server_task.await)?;
        }
    }

    if let Some(task) = poller_task {
        if let Err(err) = task.await {
            error!(?err, "error waiting for GitOps poller");
        }
    }
    if let Err(err) = sweeper_task.await {
        error!(?err, "error waiting for expiry sweeper");
    }
    info!("server stopped");
    Ok(())
}

fn flatten_join<T>(res: Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match res {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

/// Convert validated configuration subnets into the server's runtime form.
fn runtime_subnets(cfg: &config::Config) -> Vec<Subnet> {
    cfg.subnets
        .iter()
        .map(|subnet| Subnet {
            network: subnet.network,
            gateway: subnet.gateway,
            dns_servers: subnet.dns_servers.clone(),
            lease_duration: subnet.lease_duration,
            max_lease_duration: subnet.max_lease_duration,
            options: subnet.options.clone(),
            tftp_server: subnet
                .boot
                .as_ref()
                .and_then(|boot| boot.tftp_server.clone()),
            boot_filename: subnet.boot.as_ref().and_then(|boot| boot.filename.clone()),
            pools: subnet
                .pools
                .iter()
                .map(|pool| Pool {
                    range_start: pool.range_start,
                    range_end: pool.range_end,
                })
                .collect(),
        })
        .collect()
}
