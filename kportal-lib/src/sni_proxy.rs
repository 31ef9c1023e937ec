use crate::{
  access_log::access_log,
  constants::BACKEND_DIAL_TIMEOUT_MSEC,
  count::ConnectionCount,
  error::ProxyError,
  probe::probe_routing_key,
  route::RouteTable,
  socket::bind_tcp_socket,
  trace::*,
};
use bytes::BytesMut;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
  io::{AsyncWriteExt, copy_bidirectional},
  net::{TcpListener, TcpStream},
  time::{Duration, timeout},
};
use tokio_util::sync::CancellationToken;

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, derive_builder::Builder)]
/// Single virtual-host proxy listener, serving one external port with the
/// route table snapshot installed at swap time
pub struct SniProxy {
  /// Bound socket address to listen on, exposed to the client
  listen_on: SocketAddr,

  /// Immutable route table snapshot this listener routes with
  table: Arc<RouteTable>,

  #[builder(default)]
  /// Target for connections whose routing key matches no rule
  fallback: Option<SocketAddr>,

  #[builder(default = "crate::constants::TCP_BACKLOG")]
  /// TCP backlog size
  backlog: u32,

  #[builder(default = "ConnectionCount::default()")]
  /// Connection counter, set shared counter if #connections of all listeners are needed
  connection_count: ConnectionCount,

  #[builder(default = "crate::constants::MAX_TCP_CONCURRENT_CONNECTIONS")]
  /// Maximum number of concurrent connections
  max_connections: usize,

  /// Tokio runtime handle
  runtime_handle: tokio::runtime::Handle,
}

impl SniProxy {
  /// Bind the listen socket. Kept separate from `serve` so a swap can fail
  /// fast on a bind conflict before any task is spawned.
  pub(crate) fn bind(&self) -> Result<TcpListener, ProxyError> {
    let tcp_socket = bind_tcp_socket(&self.listen_on)?;
    let tcp_listener = tcp_socket.listen(self.backlog)?;
    Ok(tcp_listener)
  }

  /// Accept connections until the cancellation token fires
  pub(crate) async fn serve(self, tcp_listener: TcpListener, cancel_token: CancellationToken) {
    info!("Starting SNI proxy listener on {}", self.listen_on);
    let port = self.listen_on.port();

    let listener_service = async {
      loop {
        let (incoming_stream, src_addr) = match tcp_listener.accept().await {
          Err(e) => {
            error!("Error in TCP listener on port {port}: {e}");
            continue;
          }
          Ok(res) => res,
        };
        // Connection limit
        if self.connection_count.current() >= self.max_connections {
          warn!("TCP connection limit reached: {}", self.max_connections);
          continue;
        }
        self.connection_count.increment();
        debug!(
          "Accepted TCP connection from: {src_addr} (total: {})",
          self.connection_count.current()
        );

        self.runtime_handle.spawn({
          let table = Arc::clone(&self.table);
          let connection_count = self.connection_count.clone();
          let fallback = self.fallback;
          let cancel_token = cancel_token.clone();
          async move {
            if let Err(e) = serve_connection(incoming_stream, src_addr, port, table, fallback, cancel_token).await {
              warn!("Connection from {src_addr} closed: {e}");
            }
            connection_count.decrement();
            debug!("TCP proxy connection closed (total: {})", connection_count.current());
          }
        });
      }
    };
    tokio::select! {
      _ = listener_service => {
        error!("SNI proxy listener on port {port} stopped");
      }
      _ = cancel_token.cancelled() => {
        debug!("SNI proxy listener on port {port} cancelled");
      }
    }
  }
}

/* ---------------------------------------------------------- */
/// Probe the routing key, select the backend, and splice bytes until either
/// side closes or the listener is torn down
async fn serve_connection(
  mut incoming_stream: TcpStream,
  src_addr: SocketAddr,
  port: u16,
  table: Arc<RouteTable>,
  fallback: Option<SocketAddr>,
  cancel_token: CancellationToken,
) -> Result<(), ProxyError> {
  let mut initial_buf = BytesMut::with_capacity(crate::constants::ROUTING_KEY_PROBE_BUFFER_SIZE);
  let key = probe_routing_key(&mut incoming_stream, &mut initial_buf).await?;

  let matched = key.host.as_deref().and_then(|host| table.find_backend(port, host));
  let Some(dst_addr) = matched.or(fallback) else {
    return Err(ProxyError::NoMatchedRoute(key.host));
  };

  let dial = TcpStream::connect(dst_addr);
  let Ok(outgoing) = timeout(Duration::from_millis(BACKEND_DIAL_TIMEOUT_MSEC), dial).await else {
    return Err(ProxyError::BackendDialTimeout(dst_addr));
  };
  let mut outgoing_stream = outgoing?;

  access_log(&key, &src_addr, &dst_addr);

  // Replay the probed bytes before splicing; the backend sees the stream
  // exactly as the client sent it.
  outgoing_stream.write_all(&initial_buf).await?;

  tokio::select! {
    res = copy_bidirectional(&mut incoming_stream, &mut outgoing_stream) => {
      if let Err(e) = res {
        debug!("Bidirectional copy finished with error (maybe the timing on disconnect): {e}");
      }
    }
    _ = cancel_token.cancelled() => {
      debug!("Splice loop cancelled for {src_addr}");
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_sni_proxy_builder_defaults() {
    let handle = tokio::runtime::Handle::current();
    let listen_on: SocketAddr = "127.0.0.1:55510".parse().unwrap();
    let proxy = SniProxyBuilder::default()
      .listen_on(listen_on)
      .table(Arc::new(RouteTable::default()))
      .runtime_handle(handle)
      .build()
      .unwrap();
    assert_eq!(proxy.backlog, crate::constants::TCP_BACKLOG);
    assert_eq!(proxy.max_connections, crate::constants::MAX_TCP_CONCURRENT_CONNECTIONS);
    assert!(proxy.fallback.is_none());
    assert!(proxy.bind().is_ok());
  }
}
