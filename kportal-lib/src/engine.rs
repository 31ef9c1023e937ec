use crate::{
  count::ConnectionCount,
  error::ProxyError,
  route::RouteTable,
  sni_proxy::SniProxyBuilder,
  trace::*,
};
use std::{
  collections::HashMap,
  net::{IpAddr, Ipv4Addr, SocketAddr},
  sync::Arc,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/* ---------------------------------------------------------- */
#[derive(Debug)]
/// Live routing state: the installed table and one listener per distinct
/// external port. Rebuilt wholesale on each swap, never patched in place.
struct ProxyState {
  /// Currently installed table; accept loops hold their own `Arc` snapshot,
  /// so readers never touch the lock
  table: Arc<RouteTable>,
  /// Cancellation token per open listen port
  listeners: HashMap<u16, CancellationToken>,
}

impl Default for ProxyState {
  fn default() -> Self {
    Self {
      table: Arc::new(RouteTable::default()),
      listeners: HashMap::new(),
    }
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, derive_builder::Builder)]
/// Owner of the live routing table. `swap` rebuilds all listeners under an
/// exclusive lock; connection routing reads only immutable snapshots.
pub struct ProxyEngine {
  #[builder(default = "IpAddr::V4(Ipv4Addr::UNSPECIFIED)")]
  /// Address the per-port listeners bind to
  listen_ip: IpAddr,

  #[builder(default)]
  /// Target for connections whose routing key matches no rule
  fallback: Option<SocketAddr>,

  #[builder(default = "crate::constants::TCP_BACKLOG")]
  /// TCP backlog size passed to every listener
  backlog: u32,

  #[builder(default = "ConnectionCount::default()")]
  /// Connection counter shared by all listeners of this engine
  connection_count: ConnectionCount,

  #[builder(default = "crate::constants::MAX_TCP_CONCURRENT_CONNECTIONS")]
  /// Maximum number of concurrent connections across all listeners
  max_connections: usize,

  /// Tokio runtime handle
  runtime_handle: tokio::runtime::Handle,

  #[builder(setter(skip), default)]
  /// Lock-guarded live state; `try_lock` keeps swaps strictly serialized
  state: Arc<Mutex<ProxyState>>,

  #[builder(setter(skip), default = "CancellationToken::new()")]
  /// Root token; cancelling it tears down every listener and splice loop
  cancel_token: CancellationToken,
}

impl ProxyEngine {
  /// Install a new route table, closing the old listeners and opening one
  /// listener per distinct external port of the new table.
  ///
  /// Swaps are strictly serialized: if another swap holds the lock this
  /// returns `ProxyError::SwapInProgress` immediately so the caller can retry
  /// with bounded backoff instead of queueing. Active connections of the old
  /// table are dropped, not migrated.
  ///
  /// On a bind failure every listener opened so far is cancelled and the
  /// engine is left empty: fully old is already gone, so the only clean state
  /// is fully failed, and the next swap starts from a clean rebuild.
  pub async fn swap(&self, new_table: RouteTable) -> Result<(), ProxyError> {
    let Ok(mut state) = self.state.try_lock() else {
      return Err(ProxyError::SwapInProgress);
    };

    // Stop the previous generation of listeners (and their splice loops)
    for (port, token) in state.listeners.drain() {
      debug!("Closing proxy listener on port {port}");
      token.cancel();
    }

    let table = Arc::new(new_table);
    let mut new_listeners: HashMap<u16, CancellationToken> = HashMap::new();

    for port in table.ports() {
      let listen_on = SocketAddr::new(self.listen_ip, port);
      let proxy = SniProxyBuilder::default()
        .listen_on(listen_on)
        .table(Arc::clone(&table))
        .fallback(self.fallback)
        .backlog(self.backlog)
        .connection_count(self.connection_count.clone())
        .max_connections(self.max_connections)
        .runtime_handle(self.runtime_handle.clone())
        .build()
        .map_err(|e| ProxyError::ProxyBuildFailed(e.to_string()))?;

      let tcp_listener = match proxy.bind() {
        Ok(l) => l,
        Err(e) => {
          error!("Failed to bind proxy listener on {listen_on}: {e}");
          for token in new_listeners.into_values() {
            token.cancel();
          }
          *state = ProxyState::default();
          return Err(e);
        }
      };

      let token = self.cancel_token.child_token();
      self.runtime_handle.spawn(proxy.serve(tcp_listener, token.clone()));
      new_listeners.insert(port, token);
    }

    info!(
      "Installed route table with {} listen port(s)",
      new_listeners.len()
    );
    state.table = table;
    state.listeners = new_listeners;
    Ok(())
  }

  /// Snapshot of the currently installed table
  pub async fn current_table(&self) -> Arc<RouteTable> {
    Arc::clone(&self.state.lock().await.table)
  }

  /// Open listen ports
  pub async fn listen_ports(&self) -> Vec<u16> {
    let mut ports: Vec<u16> = self.state.lock().await.listeners.keys().copied().collect();
    ports.sort_unstable();
    ports
  }

  /// Tear down all listeners and splice loops and clear the routing state
  pub async fn stop(&self) {
    let mut state = self.state.lock().await;
    self.cancel_token.cancel();
    state.listeners.clear();
    state.table = Arc::new(RouteTable::default());
    info!("Proxy engine stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::route::RouteTableBuilder;
  use crate::service::{KnownServiceSet, ServicePort, ServiceRecord, ServiceSnapshot};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::{TcpListener, TcpStream};

  fn engine(handle: tokio::runtime::Handle) -> ProxyEngine {
    // Surface listener and splice logs when a test fails
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    ProxyEngineBuilder::default()
      .listen_ip("127.0.0.1".parse::<IpAddr>().unwrap())
      .runtime_handle(handle)
      .build()
      .unwrap()
  }

  fn table_for(external_port: u16, node_port: u16) -> RouteTable {
    let mut set = KnownServiceSet::new();
    let mut snapshot = ServiceSnapshot::new();
    snapshot.insert(
      "web".to_string(),
      ServiceRecord {
        namespace: "demo".to_string(),
        name: "web".to_string(),
        ports: vec![ServicePort {
          port: external_port,
          target_port: 8080,
          node_port,
        }],
        wildcards: None,
      },
    );
    set.insert("demo".to_string(), snapshot);
    RouteTableBuilder::new("127.0.0.1".parse().unwrap(), vec!["127.0.0.1".parse().unwrap()]).build_table(&set)
  }

  /// Minimal one-shot HTTP backend answering with a recognizable body
  async fn spawn_backend(listen_on: &str, body: &'static str) {
    let listener = TcpListener::bind(listen_on).await.unwrap();
    tokio::spawn(async move {
      loop {
        let Ok((mut stream, _)) = listener.accept().await else {
          break;
        };
        tokio::spawn(async move {
          let mut buf = vec![0u8; 1024];
          let _ = stream.read(&mut buf).await;
          let _ = stream
            .write_all(format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{body}", body.len()).as_bytes())
            .await;
        });
      }
    });
  }

  async fn http_get(proxy_addr: &str, host: &str) -> String {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream
      .write_all(format!("GET / HTTP/1.1\r\nHost: {host}\r\n\r\n").as_bytes())
      .await
      .unwrap();
    let mut response = String::new();
    let _ = stream.read_to_string(&mut response).await;
    response
  }

  #[tokio::test]
  async fn test_swap_routes_by_host_header() {
    spawn_backend("127.0.0.1:55521", "from-backend").await;
    let engine = engine(tokio::runtime::Handle::current());

    engine.swap(table_for(55520, 55521)).await.unwrap();
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    let response = http_get("127.0.0.1:55520", "web.demo.svc.cluster.local").await;
    assert!(response.contains("from-backend"), "unexpected response: {response}");

    // Unroutable host with no fallback is dropped without payload
    let response = http_get("127.0.0.1:55520", "unknown.example.com").await;
    assert!(response.is_empty());
  }

  #[tokio::test]
  async fn test_swap_replaces_previous_listeners() {
    spawn_backend("127.0.0.1:55531", "gen-one").await;
    spawn_backend("127.0.0.1:55533", "gen-two").await;
    let engine = engine(tokio::runtime::Handle::current());

    engine.swap(table_for(55530, 55531)).await.unwrap();
    assert_eq!(engine.listen_ports().await, vec![55530]);

    engine.swap(table_for(55532, 55533)).await.unwrap();
    assert_eq!(engine.listen_ports().await, vec![55532]);
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    let response = http_get("127.0.0.1:55532", "web.demo.svc.cluster.local").await;
    assert!(response.contains("gen-two"), "unexpected response: {response}");
  }

  #[tokio::test]
  async fn test_repeated_swap_is_idempotent_for_routing() {
    spawn_backend("127.0.0.1:55541", "stable").await;
    let engine = engine(tokio::runtime::Handle::current());

    engine.swap(table_for(55540, 55541)).await.unwrap();
    engine.swap(table_for(55540, 55541)).await.unwrap();
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    let response = http_get("127.0.0.1:55540", "web.demo.svc.cluster.local").await;
    assert!(response.contains("stable"), "unexpected response: {response}");
  }

  #[tokio::test]
  async fn test_concurrent_swap_is_told_to_retry() {
    let engine = engine(tokio::runtime::Handle::current());

    let state = engine.state.clone();
    let guard = state.lock().await;
    let res = engine.swap(table_for(55550, 55551)).await;
    assert!(matches!(res, Err(ProxyError::SwapInProgress)));
    drop(guard);

    engine.swap(table_for(55550, 55551)).await.unwrap();
  }

  #[tokio::test]
  async fn test_failed_swap_leaves_engine_clean() {
    let engine = engine(tokio::runtime::Handle::current());
    engine.swap(table_for(55560, 55561)).await.unwrap();

    // Occupy the next listen port without reuse options so the bind fails
    let blocker = std::net::TcpListener::bind("127.0.0.1:55563").unwrap();
    let res = engine.swap(table_for(55563, 55561)).await;
    assert!(res.is_err());
    assert!(engine.listen_ports().await.is_empty());
    assert!(engine.current_table().await.is_empty());

    // The next swap starts from a clean rebuild
    drop(blocker);
    engine.swap(table_for(55562, 55561)).await.unwrap();
    assert_eq!(engine.listen_ports().await, vec![55562]);
  }

  #[tokio::test]
  async fn test_connection_is_served_by_exactly_one_generation() {
    spawn_backend("127.0.0.1:55601", "gen-one").await;
    spawn_backend("127.0.0.1:55602", "gen-two").await;
    let engine = engine(tokio::runtime::Handle::current());
    engine.swap(table_for(55600, 55601)).await.unwrap();
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    // Flip the backend of the same external port while clients are connecting
    let swapper = tokio::spawn({
      let engine = engine.clone();
      async move {
        for node_port in [55602, 55601, 55602, 55601] {
          tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
          loop {
            match engine.swap(table_for(55600, node_port)).await {
              Ok(()) => break,
              Err(ProxyError::SwapInProgress) => {
                tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
              }
              Err(e) => panic!("swap failed: {e}"),
            }
          }
        }
      }
    });

    let mut served = 0;
    for _ in 0..50 {
      // A connect may land in the gap between listener generations
      let Ok(mut stream) = TcpStream::connect("127.0.0.1:55600").await else {
        continue;
      };
      if stream
        .write_all(b"GET / HTTP/1.1\r\nHost: web.demo.svc.cluster.local\r\n\r\n")
        .await
        .is_err()
      {
        continue;
      }
      let mut response = String::new();
      let _ = stream.read_to_string(&mut response).await;
      if response.is_empty() {
        continue;
      }
      let gen_one = response.contains("gen-one");
      let gen_two = response.contains("gen-two");
      assert!(
        gen_one ^ gen_two,
        "response not served by exactly one generation: {response}"
      );
      served += 1;
      tokio::time::sleep(tokio::time::Duration::from_millis(2)).await;
    }
    swapper.await.unwrap();
    assert!(served > 0, "no connection was served during the swaps");
  }
}
