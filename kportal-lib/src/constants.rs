use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// TCP backlog size
pub const TCP_BACKLOG: u32 = 1024;

/// Timeout to read the first few bytes of an accepted TCP stream in milliseconds
pub const ROUTING_KEY_PROBE_TIMEOUT_MSEC: u64 = 3_000;

/// TCP buffer size for routing key extraction.
/// A TLS ClientHello with a post-quantum key_share extension exceeds 1KB,
/// so the buffer must be large enough to hold the whole initial record.
/// https://datatracker.ietf.org/doc/html/rfc8446#section-5.1
pub const ROUTING_KEY_PROBE_BUFFER_SIZE: usize = 4096;

/// Max TCP concurrent connections in total of all spawned proxy listeners
pub const MAX_TCP_CONCURRENT_CONNECTIONS: usize = 1024;

/// Timeout to dial a backend in milliseconds
pub const BACKEND_DIAL_TIMEOUT_MSEC: u64 = 10_000;

/// Namespace that is never reconciled
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Synthetic cluster-local domain suffix appended to `<service>.<namespace>`
pub const CLUSTER_DOMAIN_SUFFIX: &str = "svc.cluster.local";

/// Service annotation key carrying comma-separated hostname glob patterns
pub const WILDCARD_ANNOTATION_KEY: &str = "wildcards.kportal.io";

/// Default upstream resolver for queries outside the local host table
pub const DEFAULT_DNS_UPSTREAM: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53);

/// Default DNS bind port
pub const DEFAULT_DNS_PORT: u16 = 53;

/// Timeout for forwarded upstream DNS queries in seconds
pub const DNS_UPSTREAM_TIMEOUT_SEC: u64 = 30;

/// UDP receive buffer size for DNS messages (512 bytes plus EDNS headroom)
pub const DNS_UDP_BUFFER_SIZE: usize = 4096;

/// TTL of records answered from the local host table in seconds
pub const DNS_LOCAL_TTL_SEC: u32 = 10;

/// Max attempts for a route table swap when another swap is in flight
pub const SWAP_RETRY_MAX_ATTEMPTS: usize = 5;

/// Base backoff between swap attempts in milliseconds, scaled linearly per attempt
pub const SWAP_RETRY_BACKOFF_MSEC: u64 = 100;

/// Event names for structured log lines
pub mod log_event_names {
  /// Access log for each routed connection
  pub const ACCESS_LOG: &str = "access_log";
}
