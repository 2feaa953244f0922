#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use subnet_registry::{
    EtcdConfig, HostEvent, RegistryError, RegistryResult, SubnetEvent, SubnetRegistry,
};
use tokio::{runtime::Builder, signal, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::*;

mod cli;
mod trace;

use cli::{Command, Parser};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

type Registry = Arc<SubnetRegistry>;

fn main() -> Result<()> {
    let env_loaded = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    trace::init(&config.registry_log, config.log_format)?;
    debug!(?config);
    if let Err(err) = env_loaded {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => {
                error!(?err, "registry task failed");
                Err(anyhow!(err))
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(Ok(())) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

async fn start(config: cli::Config) -> Result<()> {
    let etcd = match &config.config_path {
        Some(path) => {
            debug!(?path, "parsing etcd config");
            EtcdConfig::parse(path)?
        }
        None => {
            debug!("no config path given, using defaults");
            EtcdConfig::default()
        }
    };
    let registry: Registry = Arc::new(SubnetRegistry::new(etcd)?);

    match config.command {
        Command::Watch => watch(registry, config.alive_timeout, config.channel_size).await,
        Command::Hosts => {
            for host in registry.list_hosts().await? {
                println!("{host}");
            }
            Ok(())
        }
        Command::Subnets => {
            let listing = registry.list_subnets().await?;
            for record in &listing.subnets {
                println!("{}\t{}", record.host, record.sub);
            }
            if let Some(err) = listing.last_error {
                warn!(%err, "some subnet entries could not be decoded");
            }
            Ok(())
        }
        Command::SetNetwork {
            network,
            subnet_length,
        } => {
            registry.write_network_config(&network, subnet_length).await?;
            info!(%network, subnet_length, "network config written");
            Ok(())
        }
        Command::ShowNetwork => {
            println!("network: {}", registry.get_container_network().await?);
            println!("subnet length: {}", registry.get_subnet_length().await?);
            Ok(())
        }
    }
}

/// Run both watch loops until ctrl-c, or until one of them fails.
async fn watch(registry: Registry, alive_timeout: u64, channel_size: usize) -> Result<()> {
    if !registry.is_alive(alive_timeout).await {
        bail!("etcd cluster did not answer within {alive_timeout}s");
    }
    registry.init_hosts_namespace().await?;
    registry.init_subnets_namespace().await?;

    let token = CancellationToken::new();
    let (host_tx, host_rx) = mpsc::channel(channel_size);
    let (subnet_tx, subnet_rx) = mpsc::channel(channel_size);

    let hosts = {
        let registry = Arc::clone(&registry);
        let token = token.clone();
        spawn_watch(
            async move { registry.watch_hosts(host_tx, token).await },
            info_span!("watch", dir = "hosts"),
        )
    };
    let subnets = {
        let registry = Arc::clone(&registry);
        let token = token.clone();
        spawn_watch(
            async move { registry.watch_subnets(subnet_tx, token).await },
            info_span!("watch", dir = "subnets"),
        )
    };
    let consumer = tokio::spawn(log_events(host_rx, subnet_rx));
    let signal = tokio::spawn(shutdown_signal(token.clone()));

    let result = tokio::try_join!(flatten(hosts), flatten(subnets)).map(|_| ());
    // stop whichever loop is still running when the other one failed
    token.cancel();
    signal.abort();
    if let Err(err) = consumer.await {
        error!(?err, "error waiting for event consumer");
    }
    result
}

/// A stop is the normal way out of a watch loop.
fn spawn_watch<F>(fut: F, span: Span) -> JoinHandle<Result<()>>
where
    F: std::future::Future<Output = RegistryResult<()>> + Send + 'static,
{
    tokio::spawn(
        async move {
            match fut.await {
                Ok(()) | Err(RegistryError::WatchStopped) => {
                    debug!("watch loop stopped");
                    Ok(())
                }
                Err(err) => {
                    error!(%err, fatal = err.is_fatal(), "watch loop failed");
                    Err(err.into())
                }
            }
        }
        .instrument(span),
    )
}

async fn log_events(
    mut hosts: mpsc::Receiver<HostEvent>,
    mut subnets: mpsc::Receiver<SubnetEvent>,
) {
    loop {
        tokio::select! {
            Some(event) = hosts.recv() => {
                info!(kind = %event.kind, host = %event.host, "host event");
            }
            Some(event) = subnets.recv() => {
                info!(kind = %event.kind, host = %event.host, subnet = %event.subnet.sub, "subnet event");
            }
            else => break,
        }
    }
    debug!("event queues closed");
}

async fn flatten<T>(handle: JoinHandle<Result<T, anyhow::Error>>) -> Result<T, anyhow::Error> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    info!("shutdown requested, stopping watch loops");
    token.cancel();
    ret
}
