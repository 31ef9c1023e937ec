use std::net::SocketAddr;

/// Errors that happen during the proxy operation
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
  /* --------------------------------------- */
  #[error("IO error: {0}")]
  IoError(#[from] std::io::Error),

  /* --------------------------------------- */
  /// Another swap holds the engine lock; the caller should retry with backoff
  #[error("Route table swap already in progress")]
  SwapInProgress,

  #[error("Failed to build proxy listener: {0}")]
  ProxyBuildFailed(String),

  /* --------------------------------------- */
  #[error("Failed to read first few bytes of TCP stream")]
  TimeOutToReadTcpStream,

  #[error("No data received from TCP stream")]
  NoDataReceivedTcpStream,

  #[error("No route matched for host {0:?}")]
  NoMatchedRoute(Option<String>),

  #[error("Timeout to connect to the backend {0}")]
  BackendDialTimeout(SocketAddr),
}

/// Errors that happen inside the DNS responder
#[derive(thiserror::Error, Debug)]
pub enum DnsError {
  #[error("IO error: {0}")]
  IoError(#[from] std::io::Error),

  #[error("DNS wire format error: {0}")]
  ProtoError(#[from] hickory_proto::ProtoError),

  #[error("Upstream query timed out")]
  UpstreamTimeout,

  #[error("Truncated DNS message on TCP transport")]
  TruncatedTcpMessage,
}

/// Errors surfaced by the reconfiguration coordinator
#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
  /// The new snapshot has been persisted but the proxy still serves the previous table
  #[error("Failed to swap proxy state: {0}")]
  SwapFailed(#[from] ProxyError),
}
