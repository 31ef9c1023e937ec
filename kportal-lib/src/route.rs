use crate::{
  constants::CLUSTER_DOMAIN_SUFFIX,
  service::KnownServiceSet,
  trace::*,
};
use std::{
  collections::{BTreeMap, BTreeSet},
  net::{IpAddr, SocketAddr},
};

/* ---------------------------------------------------------- */
/// Normalize a hostname for matching: lowercase, no trailing dot
pub(crate) fn normalize_host(host: &str) -> String {
  host.trim_end_matches('.').to_ascii_lowercase()
}

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, PartialEq, Eq)]
/// One virtual-host routing rule, scoped to a single external port
pub enum RouteRule {
  /// Matches the hostname exactly
  ExactHost { host: String, backend: SocketAddr },
  /// Matches any hostname ending with the suffix (`*.x.com` stores `.x.com`,
  /// so `x.com` itself does not match)
  WildcardSuffix { suffix: String, backend: SocketAddr },
}

impl RouteRule {
  /// Check the rule against an already-normalized hostname
  pub fn matches(&self, host: &str) -> bool {
    match self {
      Self::ExactHost { host: h, .. } => h == host,
      Self::WildcardSuffix { suffix, .. } => host.ends_with(suffix.as_str()),
    }
  }

  pub fn backend(&self) -> SocketAddr {
    match self {
      Self::ExactHost { backend, .. } | Self::WildcardSuffix { backend, .. } => *backend,
    }
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Immutable routing table plus the DNS host entries derived from it.
/// A new table fully replaces the old one; it is never patched in place.
pub struct RouteTable {
  /// Rules grouped by the external port their listener serves
  rules: BTreeMap<u16, Vec<RouteRule>>,
  /// Hostname to proxy-facing addresses published via DNS
  dns_hosts: BTreeMap<String, BTreeSet<IpAddr>>,
}

impl RouteTable {
  /// Distinct external ports referenced by any rule
  pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
    self.rules.keys().copied()
  }

  pub fn rules_for_port(&self, port: u16) -> &[RouteRule] {
    self.rules.get(&port).map(|r| r.as_slice()).unwrap_or_default()
  }

  pub fn dns_hosts(&self) -> &BTreeMap<String, BTreeSet<IpAddr>> {
    &self.dns_hosts
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  /// Select the backend for a hostname presented on the given external port.
  /// Exact rules win over wildcard rules; among wildcard rules the longest
  /// matching suffix wins, ties resolved last-applied-wins.
  pub fn find_backend(&self, port: u16, host: &str) -> Option<SocketAddr> {
    let host = normalize_host(host);
    let rules = self.rules.get(&port)?;

    let exact = rules
      .iter()
      .find(|r| matches!(r, RouteRule::ExactHost { .. }) && r.matches(&host))
      .map(|r| r.backend());
    if exact.is_some() {
      return exact;
    }

    rules
      .iter()
      .filter_map(|r| match r {
        RouteRule::WildcardSuffix { suffix, .. } if r.matches(&host) => Some((suffix.len(), r.backend())),
        _ => None,
      })
      .max_by_key(|(len, _)| *len)
      .map(|(_, backend)| backend)
  }

  fn add_rule(&mut self, port: u16, rule: RouteRule) {
    self.rules.entry(port).or_default().push(rule);
  }

  fn add_dns_host(&mut self, host: &str, addrs: &[IpAddr]) {
    let entry = self.dns_hosts.entry(normalize_host(host)).or_default();
    entry.extend(addrs.iter().copied());
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug, Clone)]
/// Turns the full cross-namespace service view into a fresh `RouteTable`.
/// Deterministic given its input: the known-service set is an ordered map.
pub struct RouteTableBuilder {
  /// Node address used to dial `<cluster_ip>:<node_port>` backends
  cluster_ip: IpAddr,
  /// Proxy-facing addresses published in DNS answers, one per address family
  proxy_ips: Vec<IpAddr>,
}

impl RouteTableBuilder {
  pub fn new(cluster_ip: IpAddr, proxy_ips: Vec<IpAddr>) -> Self {
    Self { cluster_ip, proxy_ips }
  }

  /// Build a table over the union of all known namespaces
  pub fn build_table(&self, services: &KnownServiceSet) -> RouteTable {
    let mut table = RouteTable::default();

    for (namespace, snapshot) in services {
      for (name, svc) in snapshot {
        let patterns = parse_wildcard_patterns(svc.wildcards.as_deref());
        for p in &svc.ports {
          if p.node_port == 0 {
            // Nothing can be directed to it from outside the cluster
            debug!("Skipping {name}.{namespace} port {} without node port", p.port);
            continue;
          }
          let backend = SocketAddr::new(self.cluster_ip, p.node_port);
          let cluster_hostname = format!("{name}.{namespace}.{CLUSTER_DOMAIN_SUFFIX}");
          debug!("Routing {cluster_hostname}:{} to {backend}", p.port);

          table.add_rule(
            p.port,
            RouteRule::ExactHost {
              host: cluster_hostname.clone(),
              backend,
            },
          );
          table.add_dns_host(&cluster_hostname, &self.proxy_ips);

          for pattern in &patterns {
            if let Some(suffix) = pattern.strip_prefix('*') {
              debug!("Routing {pattern}:{} to {backend}", p.port);
              table.add_rule(
                p.port,
                RouteRule::WildcardSuffix {
                  suffix: suffix.to_string(),
                  backend,
                },
              );
            } else {
              // Malformed glob degrades to a literal hostname rule, never fails
              warn!("Wildcard pattern {pattern:?} has no leading '*', treating as literal hostname");
              table.add_rule(
                p.port,
                RouteRule::ExactHost {
                  host: pattern.clone(),
                  backend,
                },
              );
            }
            // DNS cannot truly wildcard-match; only the literal pattern string
            // resolves via DNS while the proxy matches any suffix.
            table.add_dns_host(pattern, &self.proxy_ips);
          }
        }
      }
    }
    table
  }
}

/// Split the comma-separated annotation value into normalized patterns
fn parse_wildcard_patterns(raw: Option<&str>) -> Vec<String> {
  raw
    .unwrap_or_default()
    .split(',')
    .map(str::trim)
    .filter(|p| !p.is_empty())
    .map(normalize_host)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::service::{ServicePort, ServiceRecord, ServiceSnapshot};

  fn known_services(records: Vec<ServiceRecord>) -> KnownServiceSet {
    let mut set = KnownServiceSet::new();
    for r in records {
      set
        .entry(r.namespace.clone())
        .or_insert_with(ServiceSnapshot::new)
        .insert(r.name.clone(), r);
    }
    set
  }

  fn web_service(wildcards: Option<&str>) -> ServiceRecord {
    ServiceRecord {
      namespace: "demo".to_string(),
      name: "web".to_string(),
      ports: vec![ServicePort {
        port: 443,
        target_port: 8443,
        node_port: 30443,
      }],
      wildcards: wildcards.map(|w| w.to_string()),
    }
  }

  fn builder() -> RouteTableBuilder {
    RouteTableBuilder::new("10.0.0.5".parse().unwrap(), vec!["127.0.0.1".parse().unwrap()])
  }

  #[test]
  fn test_rule_matching_per_variant() {
    let backend: SocketAddr = "10.0.0.5:30443".parse().unwrap();

    let exact = RouteRule::ExactHost {
      host: "web.demo.svc.cluster.local".to_string(),
      backend,
    };
    assert!(exact.matches("web.demo.svc.cluster.local"));
    assert!(!exact.matches("a.web.demo.svc.cluster.local"));
    assert_eq!(exact.backend(), backend);

    let wildcard = RouteRule::WildcardSuffix {
      suffix: ".demo.example.com".to_string(),
      backend,
    };
    assert!(wildcard.matches("a.demo.example.com"));
    assert!(!wildcard.matches("demo.example.com"));
    assert_eq!(wildcard.backend(), backend);
  }

  #[test]
  fn test_exact_rule_and_dns_entry_for_node_port_service() {
    let table = builder().build_table(&known_services(vec![web_service(None)]));

    let backend = table.find_backend(443, "web.demo.svc.cluster.local");
    assert_eq!(backend, Some("10.0.0.5:30443".parse().unwrap()));

    let dns = table.dns_hosts().get("web.demo.svc.cluster.local").unwrap();
    assert!(dns.contains(&"127.0.0.1".parse::<IpAddr>().unwrap()));
  }

  #[test]
  fn test_zero_node_port_produces_nothing() {
    let mut svc = web_service(None);
    svc.ports[0].node_port = 0;
    let table = builder().build_table(&known_services(vec![svc]));

    assert!(table.is_empty());
    assert!(table.dns_hosts().is_empty());
  }

  #[test]
  fn test_wildcard_suffix_matching() {
    let table = builder().build_table(&known_services(vec![web_service(Some("*.demo.example.com"))]));

    let backend: SocketAddr = "10.0.0.5:30443".parse().unwrap();
    assert_eq!(table.find_backend(443, "foo.demo.example.com"), Some(backend));
    assert_eq!(table.find_backend(443, "a.b.demo.example.com"), Some(backend));
    assert_eq!(table.find_backend(443, "demo.example.com"), None);

    // Only the literal pattern string resolves via DNS
    assert!(table.dns_hosts().contains_key("*.demo.example.com"));
  }

  #[test]
  fn test_exact_match_wins_over_wildcard() {
    let mut api = web_service(Some("*.demo.svc.cluster.local"));
    api.name = "api".to_string();
    api.ports[0].node_port = 30500;
    let table = builder().build_table(&known_services(vec![web_service(None), api]));

    // web.demo matches api's wildcard too, but the exact rule must win
    assert_eq!(
      table.find_backend(443, "web.demo.svc.cluster.local"),
      Some("10.0.0.5:30443".parse().unwrap())
    );
    assert_eq!(
      table.find_backend(443, "other.demo.svc.cluster.local"),
      Some("10.0.0.5:30500".parse().unwrap())
    );
  }

  #[test]
  fn test_longest_wildcard_suffix_wins() {
    let mut coarse = web_service(Some("*.example.com"));
    let mut fine = web_service(Some("*.demo.example.com"));
    fine.name = "fine".to_string();
    fine.ports[0].node_port = 30600;
    coarse.name = "coarse".to_string();
    let table = builder().build_table(&known_services(vec![coarse, fine]));

    assert_eq!(
      table.find_backend(443, "foo.demo.example.com"),
      Some("10.0.0.5:30600".parse().unwrap())
    );
    assert_eq!(
      table.find_backend(443, "foo.example.com"),
      Some("10.0.0.5:30443".parse().unwrap())
    );
  }

  #[test]
  fn test_pattern_without_star_degrades_to_literal() {
    let table = builder().build_table(&known_services(vec![web_service(Some("portal.example.com"))]));

    let backend: SocketAddr = "10.0.0.5:30443".parse().unwrap();
    assert_eq!(table.find_backend(443, "portal.example.com"), Some(backend));
    assert_eq!(table.find_backend(443, "sub.portal.example.com"), None);
  }

  #[test]
  fn test_multiple_patterns_in_annotation() {
    let table = builder().build_table(&known_services(vec![web_service(Some(
      "*.demo.example.com, *.other.example.com",
    ))]));

    let backend: SocketAddr = "10.0.0.5:30443".parse().unwrap();
    assert_eq!(table.find_backend(443, "a.demo.example.com"), Some(backend));
    assert_eq!(table.find_backend(443, "b.other.example.com"), Some(backend));
  }

  #[test]
  fn test_build_is_deterministic() {
    let services = known_services(vec![web_service(Some("*.demo.example.com"))]);
    let b = builder();
    assert_eq!(b.build_table(&services), b.build_table(&services));
  }

  #[test]
  fn test_host_matching_is_case_insensitive() {
    let table = builder().build_table(&known_services(vec![web_service(None)]));
    assert!(table.find_backend(443, "Web.Demo.SVC.Cluster.Local").is_some());
  }

  #[test]
  fn test_proxy_ips_per_address_family() {
    let b = RouteTableBuilder::new(
      "10.0.0.5".parse().unwrap(),
      vec!["127.0.0.1".parse().unwrap(), "::1".parse().unwrap()],
    );
    let table = b.build_table(&known_services(vec![web_service(None)]));
    let dns = table.dns_hosts().get("web.demo.svc.cluster.local").unwrap();
    assert_eq!(dns.len(), 2);
  }
}
