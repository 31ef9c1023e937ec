use std::collections::{BTreeMap, BTreeSet};

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// One exposed port tuple of a service
pub struct ServicePort {
  /// Port exposed to clients of the proxy
  pub port: u16,
  /// Port the service targets inside the cluster
  pub target_port: u16,
  /// Cluster-wide node port; 0 means the port is unroutable from outside
  pub node_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Immutable snapshot of one exposed service, captured at reconciliation time
pub struct ServiceRecord {
  pub namespace: String,
  pub name: String,
  /// Ordered as observed; compared as a set
  pub ports: Vec<ServicePort>,
  /// Raw value of the `wildcards.kportal.io` annotation, if any
  pub wildcards: Option<String>,
}

/// Observed services of one namespace, keyed by service name
pub type ServiceSnapshot = BTreeMap<String, ServiceRecord>;

/// Last acted-on state across all namespaces
pub type KnownServiceSet = BTreeMap<String, ServiceSnapshot>;

/* ---------------------------------------------------------- */
/// Decide whether a namespace's service set materially changed.
///
/// Two snapshots are equal iff they contain the same set of service names and,
/// for each name, the wildcard annotation is equal and the set of port tuples
/// is equal regardless of order. Fields irrelevant to routing do not appear in
/// `ServiceRecord` at all, so they can never trigger a rebuild.
pub fn snapshots_equal(prev: &ServiceSnapshot, next: &ServiceSnapshot) -> bool {
  if prev.len() != next.len() {
    return false;
  }
  prev.iter().all(|(name, a)| {
    next.get(name).is_some_and(|b| {
      a.wildcards == b.wildcards && a.ports.iter().collect::<BTreeSet<_>>() == b.ports.iter().collect::<BTreeSet<_>>()
    })
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(name: &str, ports: &[(u16, u16, u16)], wildcards: Option<&str>) -> ServiceRecord {
    ServiceRecord {
      namespace: "demo".to_string(),
      name: name.to_string(),
      ports: ports
        .iter()
        .map(|&(port, target_port, node_port)| ServicePort {
          port,
          target_port,
          node_port,
        })
        .collect(),
      wildcards: wildcards.map(|w| w.to_string()),
    }
  }

  fn snapshot(records: Vec<ServiceRecord>) -> ServiceSnapshot {
    records.into_iter().map(|r| (r.name.clone(), r)).collect()
  }

  #[test]
  fn test_identical_snapshots_are_equal() {
    let a = snapshot(vec![record("web", &[(443, 8443, 30443)], None)]);
    let b = snapshot(vec![record("web", &[(443, 8443, 30443)], None)]);
    assert!(snapshots_equal(&a, &b));
  }

  #[test]
  fn test_port_order_is_irrelevant() {
    let a = snapshot(vec![record("web", &[(443, 8443, 30443), (80, 8080, 30080)], None)]);
    let b = snapshot(vec![record("web", &[(80, 8080, 30080), (443, 8443, 30443)], None)]);
    assert!(snapshots_equal(&a, &b));
  }

  #[test]
  fn test_node_port_change_is_a_change() {
    let a = snapshot(vec![record("web", &[(443, 8443, 30443)], None)]);
    let b = snapshot(vec![record("web", &[(443, 8443, 30444)], None)]);
    assert!(!snapshots_equal(&a, &b));
  }

  #[test]
  fn test_annotation_change_is_a_change() {
    let a = snapshot(vec![record("web", &[(443, 8443, 30443)], Some("*.demo.example.com"))]);
    let b = snapshot(vec![record("web", &[(443, 8443, 30443)], Some("*.other.example.com"))]);
    assert!(!snapshots_equal(&a, &b));
  }

  #[test]
  fn test_added_and_removed_services() {
    let a = snapshot(vec![record("web", &[(443, 8443, 30443)], None)]);
    let b = snapshot(vec![
      record("web", &[(443, 8443, 30443)], None),
      record("api", &[(80, 8080, 30080)], None),
    ]);
    assert!(!snapshots_equal(&a, &b));
    assert!(!snapshots_equal(&b, &a));
  }

  #[test]
  fn test_empty_snapshots_are_equal() {
    assert!(snapshots_equal(&ServiceSnapshot::new(), &ServiceSnapshot::new()));
  }
}
