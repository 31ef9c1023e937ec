use crate::log::warn;
use anyhow::anyhow;
use kportal_lib::{
  DEFAULT_DNS_PORT, DEFAULT_DNS_UPSTREAM, KnownServiceSet, ServicePort, ServiceRecord, ServiceSnapshot,
  WILDCARD_ANNOTATION_KEY,
};
use serde::Deserialize;
use std::{
  collections::{HashMap, HashSet},
  fs,
  net::{IpAddr, Ipv4Addr, SocketAddr},
};

#[derive(Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct ConfigToml {
  /// Node address that node ports of exposed services are dialed at
  pub cluster_ip: Option<String>,
  /// Addresses published in DNS answers for proxied hostnames; defaults to the cluster ip
  pub proxy_ips: Option<Vec<String>>,
  /// Address the per-port proxy listeners bind to
  pub proxy_listen_ip: Option<String>,
  /// Target for connections matching no route
  pub fallback_target: Option<String>,
  // DNS responder
  pub dns_bind_ips: Option<Vec<String>>,
  pub dns_bind_port: Option<u16>,
  pub dns_upstream: Option<String>,
  // observed service state per namespace
  pub namespaces: Option<HashMap<String, NamespaceToml>>,
}

#[derive(Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct NamespaceToml {
  pub services: Option<HashMap<String, ServiceToml>>,
}

#[derive(Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct ServiceToml {
  pub ports: Option<Vec<PortToml>>,
  pub annotations: Option<HashMap<String, String>>,
}

#[derive(Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct PortToml {
  pub port: u16,
  pub target_port: Option<u16>,
  /// 0 or absent means the port is unroutable from outside the cluster
  pub node_port: Option<u16>,
}

impl ConfigToml {
  pub fn new(config_file: &str) -> Result<Self, anyhow::Error> {
    let config_str = fs::read_to_string(config_file)?;
    Self::from_str(&config_str)
  }

  fn from_str(config_str: &str) -> Result<Self, anyhow::Error> {
    // Check unused fields during deserialization
    let t = toml::de::Deserializer::new(config_str);
    let mut unused = HashSet::new();

    let res = serde_ignored::deserialize(t, |path| {
      unused.insert(path.to_string());
    })
    .map_err(|e| anyhow::anyhow!(e));

    if !unused.is_empty() {
      let str = unused.iter().fold(String::new(), |acc, x| acc + x + "\n");
      warn!("Configuration file contains unsupported fields. Check typos:\n{}", str);
    }

    res
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug, Clone)]
/// Validated portal configuration derived from the toml representation
pub struct PortalConfig {
  pub cluster_ip: IpAddr,
  pub proxy_ips: Vec<IpAddr>,
  pub proxy_listen_ip: IpAddr,
  pub fallback: Option<SocketAddr>,
  pub dns_listen_on: Vec<SocketAddr>,
  pub dns_upstream: SocketAddr,
  pub services: KnownServiceSet,
}

impl TryFrom<ConfigToml> for PortalConfig {
  type Error = anyhow::Error;

  fn try_from(config_toml: ConfigToml) -> Result<Self, Self::Error> {
    let Some(cluster_ip) = config_toml.cluster_ip else {
      return Err(anyhow!("cluster_ip is required"));
    };
    let cluster_ip: IpAddr = cluster_ip.parse().map_err(|_| anyhow!("Invalid cluster_ip: {cluster_ip}"))?;

    let proxy_ips = match config_toml.proxy_ips {
      None => vec![cluster_ip],
      Some(ips) => ips
        .iter()
        .map(|ip| ip.parse::<IpAddr>().map_err(|_| anyhow!("Invalid proxy ip: {ip}")))
        .collect::<Result<Vec<_>, _>>()?,
    };
    if proxy_ips.is_empty() {
      return Err(anyhow!("proxy_ips must not be empty"));
    }

    let proxy_listen_ip = match config_toml.proxy_listen_ip {
      None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
      Some(ip) => ip.parse().map_err(|_| anyhow!("Invalid proxy_listen_ip: {ip}"))?,
    };

    let fallback = config_toml
      .fallback_target
      .map(|t| t.parse::<SocketAddr>().map_err(|_| anyhow!("Invalid fallback_target: {t}")))
      .transpose()?;

    let dns_bind_port = config_toml.dns_bind_port.unwrap_or(DEFAULT_DNS_PORT);
    let dns_listen_on = match config_toml.dns_bind_ips {
      None => vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), dns_bind_port)],
      Some(ips) => ips
        .iter()
        .map(|ip| {
          ip.parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, dns_bind_port))
            .map_err(|_| anyhow!("Invalid dns bind ip: {ip}"))
        })
        .collect::<Result<Vec<_>, _>>()?,
    };

    let dns_upstream = match config_toml.dns_upstream {
      None => DEFAULT_DNS_UPSTREAM,
      Some(u) => u.parse().map_err(|_| anyhow!("Invalid dns_upstream: {u}"))?,
    };

    let mut services = KnownServiceSet::new();
    for (namespace, ns_toml) in config_toml.namespaces.unwrap_or_default() {
      let mut snapshot = ServiceSnapshot::new();
      for (name, svc_toml) in ns_toml.services.unwrap_or_default() {
        let ports = svc_toml
          .ports
          .unwrap_or_default()
          .iter()
          .map(|p| ServicePort {
            port: p.port,
            target_port: p.target_port.unwrap_or(p.port),
            node_port: p.node_port.unwrap_or(0),
          })
          .collect();
        let wildcards = svc_toml
          .annotations
          .as_ref()
          .and_then(|a| a.get(WILDCARD_ANNOTATION_KEY).cloned());
        snapshot.insert(
          name.clone(),
          ServiceRecord {
            namespace: namespace.clone(),
            name,
            ports,
            wildcards,
          },
        );
      }
      services.insert(namespace, snapshot);
    }

    Ok(Self {
      cluster_ip,
      proxy_ips,
      proxy_listen_ip,
      fallback,
      dns_listen_on,
      dns_upstream,
      services,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = r#"
cluster_ip = "10.0.0.5"
proxy_ips = ["192.0.2.1"]
dns_bind_ips = ["127.0.0.1"]
dns_bind_port = 10053

[namespaces.demo.services.web]
ports = [{ port = 443, target_port = 8443, node_port = 30443 }]

[namespaces.demo.services.web.annotations]
"wildcards.kportal.io" = "*.demo.example.com"
"unrelated.annotation/key" = "ignored"
"#;

  #[test]
  fn test_sample_config_parses() {
    let config = PortalConfig::try_from(ConfigToml::from_str(SAMPLE).unwrap()).unwrap();

    assert_eq!(config.cluster_ip, "10.0.0.5".parse::<IpAddr>().unwrap());
    assert_eq!(config.proxy_ips, vec!["192.0.2.1".parse::<IpAddr>().unwrap()]);
    assert_eq!(config.dns_listen_on, vec!["127.0.0.1:10053".parse().unwrap()]);
    assert_eq!(config.dns_upstream, DEFAULT_DNS_UPSTREAM);

    let web = &config.services["demo"]["web"];
    assert_eq!(web.ports[0].node_port, 30443);
    assert_eq!(web.wildcards.as_deref(), Some("*.demo.example.com"));
  }

  #[test]
  fn test_cluster_ip_is_required() {
    assert!(PortalConfig::try_from(ConfigToml::from_str("proxy_ips = [\"192.0.2.1\"]").unwrap()).is_err());
  }

  #[test]
  fn test_proxy_ips_default_to_cluster_ip() {
    let config = PortalConfig::try_from(ConfigToml::from_str("cluster_ip = \"10.0.0.5\"").unwrap()).unwrap();
    assert_eq!(config.proxy_ips, vec![config.cluster_ip]);
  }

  #[test]
  fn test_missing_node_port_defaults_to_unroutable() {
    let config = PortalConfig::try_from(
      ConfigToml::from_str(
        r#"
cluster_ip = "10.0.0.5"
[namespaces.demo.services.web]
ports = [{ port = 80 }]
"#,
      )
      .unwrap(),
    )
    .unwrap();
    let web = &config.services["demo"]["web"];
    assert_eq!(web.ports[0].node_port, 0);
    assert_eq!(web.ports[0].target_port, 80);
  }
}
