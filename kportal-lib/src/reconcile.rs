use crate::{
  constants::{KUBE_SYSTEM_NAMESPACE, SWAP_RETRY_BACKOFF_MSEC, SWAP_RETRY_MAX_ATTEMPTS},
  dns::DnsHostTable,
  engine::ProxyEngine,
  error::{ProxyError, ReconcileError},
  route::{RouteTable, RouteTableBuilder},
  service::{KnownServiceSet, ServiceSnapshot, snapshots_equal},
  trace::*,
};
use std::{
  collections::{BTreeMap, BTreeSet},
  net::IpAddr,
  sync::Arc,
  time::Duration,
};
use tokio::sync::Mutex;

/* ---------------------------------------------------------- */
#[derive(Debug, Default)]
/// State the coordinator carries between reconciliations
struct CoordinatorState {
  /// Last acted-on snapshot per namespace
  known: KnownServiceSet,
  /// DNS entries currently installed in the host table, kept so the next
  /// reconciliation can remove exactly what it added and nothing else
  applied_dns: BTreeMap<String, BTreeSet<IpAddr>>,
}

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, derive_builder::Builder)]
/// Drives the proxy engine and the DNS host table from per-namespace service
/// snapshots. Unchanged snapshots are dropped before any rebuild work.
pub struct ReconfigurationCoordinator {
  /// Builds a fresh table over the union of all known namespaces
  table_builder: RouteTableBuilder,

  /// Proxy engine receiving the rebuilt tables
  engine: ProxyEngine,

  #[builder(default)]
  /// Host table shared with the DNS responder
  dns_table: DnsHostTable,

  #[builder(setter(skip), default)]
  state: Arc<Mutex<CoordinatorState>>,
}

impl ReconfigurationCoordinator {
  /// Reconcile one namespace against its freshly observed snapshot.
  ///
  /// Returns `Ok(true)` when a new table was installed, `Ok(false)` when the
  /// event was dropped as a no-op. The snapshot is persisted before the swap
  /// is attempted, so a failed swap leaves the proxy on the previous table
  /// while the recorded state already reflects the new snapshot; the next
  /// successful reconciliation converges both.
  pub async fn reconcile(&self, namespace: &str, snapshot: ServiceSnapshot) -> Result<bool, ReconcileError> {
    if namespace == KUBE_SYSTEM_NAMESPACE {
      debug!("Ignoring reconciliation event for {namespace}");
      return Ok(false);
    }

    let mut state = self.state.lock().await;

    // A namespace observed for the first time always counts as changed
    let changed = match state.known.get(namespace) {
      None => true,
      Some(prev) => !snapshots_equal(prev, &snapshot),
    };
    if !changed {
      debug!("Snapshot for namespace {namespace} unchanged, skipping rebuild");
      return Ok(false);
    }

    info!(
      "Namespace {namespace} changed ({} service(s)), rebuilding route table",
      snapshot.len()
    );
    state.known.insert(namespace.to_string(), snapshot);

    let table = self.table_builder.build_table(&state.known);
    self.apply_dns_entries(&mut state.applied_dns, table.dns_hosts());
    self.swap_with_retry(&table).await?;
    Ok(true)
  }

  /// Bring the shared DNS host table to the target entry set by applying the
  /// delta against what this coordinator installed previously. Adds and
  /// removes are idempotent, so replays are harmless.
  fn apply_dns_entries(&self, applied: &mut BTreeMap<String, BTreeSet<IpAddr>>, target: &BTreeMap<String, BTreeSet<IpAddr>>) {
    for (host, addrs) in target {
      let installed = applied.get(host);
      for addr in addrs {
        if installed.is_none_or(|set| !set.contains(addr)) {
          self.dns_table.add_host(host, *addr);
        }
      }
    }
    for (host, addrs) in applied.iter() {
      let kept = target.get(host);
      for addr in addrs {
        if kept.is_none_or(|set| !set.contains(addr)) {
          self.dns_table.remove_host(host, *addr);
        }
      }
    }
    *applied = target.clone();
  }

  /// Swap with bounded retry; only `SwapInProgress` is worth retrying, any
  /// other failure reflects a broken bind and is surfaced immediately.
  async fn swap_with_retry(&self, table: &RouteTable) -> Result<(), ReconcileError> {
    for attempt in 1..=SWAP_RETRY_MAX_ATTEMPTS {
      match self.engine.swap(table.clone()).await {
        Ok(()) => return Ok(()),
        Err(ProxyError::SwapInProgress) => {
          debug!("Swap busy, retrying (attempt {attempt}/{SWAP_RETRY_MAX_ATTEMPTS})");
          tokio::time::sleep(Duration::from_millis(SWAP_RETRY_BACKOFF_MSEC * attempt as u64)).await;
        }
        Err(e) => return Err(ReconcileError::SwapFailed(e)),
      }
    }
    Err(ReconcileError::SwapFailed(ProxyError::SwapInProgress))
  }

  /// Last acted-on snapshot of a namespace, if any
  pub async fn known_snapshot(&self, namespace: &str) -> Option<ServiceSnapshot> {
    self.state.lock().await.known.get(namespace).cloned()
  }
}
