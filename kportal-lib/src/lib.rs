mod access_log;
mod constants;
mod count;
mod dns;
mod engine;
mod error;
mod http;
mod probe;
mod reconcile;
mod route;
mod service;
mod sni_proxy;
mod socket;
mod tls;
mod trace;

pub use constants::{DEFAULT_DNS_PORT, DEFAULT_DNS_UPSTREAM, KUBE_SYSTEM_NAMESPACE, WILDCARD_ANNOTATION_KEY};
pub use count::ConnectionCount;
pub use dns::{DnsHostTable, DnsResponder, DnsResponderBuilder};
pub use engine::{ProxyEngine, ProxyEngineBuilder};
pub use error::{DnsError, ProxyError, ReconcileError};
pub use reconcile::{ReconfigurationCoordinator, ReconfigurationCoordinatorBuilder};
pub use route::{RouteRule, RouteTable, RouteTableBuilder};
pub use service::{KnownServiceSet, ServicePort, ServiceRecord, ServiceSnapshot, snapshots_equal};
