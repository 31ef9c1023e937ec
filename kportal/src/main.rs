mod config;
mod log;

use crate::{
  config::{ConfigToml, ConfigTomlReloader, PortalConfig, parse_opts},
  log::*,
};
use hot_reload::{ReloaderReceiver, ReloaderService};
use kportal_lib::{
  DnsResponderBuilder, ProxyEngineBuilder, ReconfigurationCoordinator, ReconfigurationCoordinatorBuilder,
  RouteTableBuilder, ServiceSnapshot,
};
use std::collections::BTreeSet;

/// Delay in seconds to watch the config file for changes
const CONFIG_WATCH_DELAY_SECS: u32 = 15;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
  init_logger();

  let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
  runtime_builder.enable_all();
  runtime_builder.thread_name("kportal");
  let runtime = runtime_builder.build().unwrap();

  runtime.block_on(async {
    info!("Starting kportal: reconfigurable DNS and SNI proxy portal");

    let opts = match parse_opts() {
      Ok(opts) => opts,
      Err(e) => {
        error!("Invalid options: {e}");
        std::process::exit(1);
      }
    };

    let (config_service, config_rx) =
      match ReloaderService::<ConfigTomlReloader, ConfigToml>::new(&opts.config_file_path, CONFIG_WATCH_DELAY_SECS, false)
        .await
      {
        Ok(v) => v,
        Err(e) => {
          error!("Failed to start the config reloader service: {e}");
          std::process::exit(1);
        }
      };

    tokio::select! {
      res = config_service.start() => {
        if let Err(e) = res {
          error!("Config reloader service stopped: {e}");
        }
      }
      res = portal_service(config_rx, runtime.handle().clone()) => {
        if let Err(e) = res {
          error!("Portal service stopped: {e}");
        }
      }
    }
  });
}

/* ---------------------------------------------------------- */
/// Bring up the DNS responder and the proxy engine from the initial config,
/// then reconcile namespaces on every config reload until shutdown
async fn portal_service(
  mut config_rx: ReloaderReceiver<ConfigToml>,
  runtime_handle: tokio::runtime::Handle,
) -> Result<(), anyhow::Error> {
  // The reloader service publishes the initial config as the first change
  config_rx.changed().await?;
  let config_toml = config_rx
    .borrow()
    .clone()
    .ok_or_else(|| anyhow::anyhow!("Something wrong in config reloader receiver"))?;
  let config = PortalConfig::try_from(config_toml)?;

  let cancel_token = tokio_util::sync::CancellationToken::new();

  let dns_responder = DnsResponderBuilder::default()
    .listen_on(config.dns_listen_on.clone())
    .upstream(config.dns_upstream)
    .runtime_handle(runtime_handle.clone())
    .build()?;
  let dns_table = dns_responder.host_table();

  let engine = ProxyEngineBuilder::default()
    .listen_ip(config.proxy_listen_ip)
    .fallback(config.fallback)
    .runtime_handle(runtime_handle.clone())
    .build()?;

  let coordinator = ReconfigurationCoordinatorBuilder::default()
    .table_builder(RouteTableBuilder::new(config.cluster_ip, config.proxy_ips.clone()))
    .engine(engine)
    .dns_table(dns_table)
    .build()?;

  runtime_handle.spawn({
    let child_token = cancel_token.child_token();
    async move {
      if let Err(e) = dns_responder.start(child_token).await {
        error!("DNS responder stopped: {e}");
      }
    }
  });

  let mut active_namespaces = reconcile_all(&coordinator, config.services, BTreeSet::new()).await;

  loop {
    config_rx.changed().await?;
    let Some(config_toml) = config_rx.borrow().clone() else {
      continue;
    };
    info!("Configuration reloaded, reconciling namespaces");
    match PortalConfig::try_from(config_toml) {
      Ok(new_config) => {
        // Addresses and bind points are fixed for the process lifetime
        if new_config.cluster_ip != config.cluster_ip || new_config.proxy_ips != config.proxy_ips {
          warn!("cluster_ip/proxy_ips changed in config; a restart is required to apply them");
        }
        active_namespaces = reconcile_all(&coordinator, new_config.services, active_namespaces).await;
      }
      Err(e) => {
        warn!("Reloaded configuration is invalid, keeping the current state: {e}");
      }
    }
  }
}

/// Reconcile every namespace of the new view; namespaces that disappeared from
/// the config are reconciled with an empty snapshot so their state is removed.
async fn reconcile_all(
  coordinator: &ReconfigurationCoordinator,
  services: kportal_lib::KnownServiceSet,
  previous: BTreeSet<String>,
) -> BTreeSet<String> {
  let mut current = BTreeSet::new();
  for namespace in previous {
    if !services.contains_key(&namespace) {
      if let Err(e) = coordinator.reconcile(&namespace, ServiceSnapshot::new()).await {
        error!("Failed to remove namespace {namespace}: {e}");
      }
    }
  }
  for (namespace, snapshot) in services {
    match coordinator.reconcile(&namespace, snapshot).await {
      Ok(reconfigured) => {
        if reconfigured {
          info!("Reconfigured portal for namespace {namespace}");
        }
        current.insert(namespace);
      }
      Err(e) => {
        // Snapshot already recorded; the next reconciliation converges
        error!("Failed to reconcile namespace {namespace}: {e}");
        current.insert(namespace);
      }
    }
  }
  current
}
