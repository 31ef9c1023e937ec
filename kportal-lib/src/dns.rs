use crate::{
  constants::{DNS_LOCAL_TTL_SEC, DNS_UDP_BUFFER_SIZE},
  error::DnsError,
  route::normalize_host,
  socket::{bind_tcp_socket, bind_udp_socket},
  trace::*,
};
use hickory_proto::{
  op::{Message, MessageType, Query, ResponseCode},
  rr::{RData, Record, RecordType},
};
use std::{
  collections::BTreeSet,
  net::{IpAddr, SocketAddr},
  sync::Arc,
  time::Duration,
};
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::{TcpListener, TcpStream, UdpSocket},
  time::timeout,
};
use tokio_util::sync::CancellationToken;

/// DashMap type alias, uses ahash::RandomState as hashbuilder
type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, Default)]
/// Hostname to address-set table answered authoritatively by the responder.
/// Shared handle; adds and removes are idempotent and guarded by the map's
/// own sharded locks, independent of the proxy's route table lock.
pub struct DnsHostTable(Arc<DashMap<String, BTreeSet<IpAddr>>>);

impl DnsHostTable {
  /// Add an address for a hostname; adding an existing pair is a no-op
  pub fn add_host(&self, host: &str, addr: IpAddr) {
    self.0.entry(normalize_host(host)).or_default().insert(addr);
  }

  /// Remove an address for a hostname; removing a non-existent pair is a no-op
  pub fn remove_host(&self, host: &str, addr: IpAddr) {
    let host = normalize_host(host);
    if let Some(mut entry) = self.0.get_mut(&host) {
      entry.remove(&addr);
    }
    self.0.remove_if(&host, |_, addrs| addrs.is_empty());
  }

  /// Address set for an exact hostname match
  pub fn lookup(&self, host: &str) -> Option<BTreeSet<IpAddr>> {
    self.0.get(&normalize_host(host)).map(|entry| entry.clone())
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, derive_builder::Builder)]
/// Authoritative-for-known-names resolver with upstream forwarding for
/// everything else, listening on UDP and TCP per configured bind address
pub struct DnsResponder {
  /// Bind addresses; each one gets a UDP and a TCP listener
  listen_on: Vec<SocketAddr>,

  #[builder(default = "crate::constants::DEFAULT_DNS_UPSTREAM")]
  /// Upstream resolver for names outside the host table
  upstream: SocketAddr,

  #[builder(default = "Duration::from_secs(crate::constants::DNS_UPSTREAM_TIMEOUT_SEC)")]
  /// Bound on each forwarded upstream query
  upstream_timeout: Duration,

  #[builder(default)]
  /// Shared host table; the reconciler mutates it while queries resolve
  host_table: DnsHostTable,

  /// Tokio runtime handle
  runtime_handle: tokio::runtime::Handle,
}

impl DnsResponder {
  /// Shared handle to the host table
  pub fn host_table(&self) -> DnsHostTable {
    self.host_table.clone()
  }

  /// Bind all listeners, then serve until the cancellation token fires
  pub async fn start(&self, cancel_token: CancellationToken) -> Result<(), DnsError> {
    let handler = DnsQueryHandler {
      host_table: self.host_table.clone(),
      upstream: self.upstream,
      upstream_timeout: self.upstream_timeout,
    };

    // Bind everything first so a bad address fails the whole start
    let mut udp_sockets = Vec::new();
    let mut tcp_listeners = Vec::new();
    for addr in &self.listen_on {
      let udp_socket = UdpSocket::from_std(bind_udp_socket(addr)?)?;
      let tcp_listener = bind_tcp_socket(addr)?.listen(crate::constants::TCP_BACKLOG)?;
      info!("Starting DNS responder on udp/tcp {addr}");
      udp_sockets.push(udp_socket);
      tcp_listeners.push(tcp_listener);
    }

    for udp_socket in udp_sockets {
      self.runtime_handle.spawn(serve_udp(
        Arc::new(udp_socket),
        handler.clone(),
        self.runtime_handle.clone(),
        cancel_token.child_token(),
      ));
    }
    for tcp_listener in tcp_listeners {
      self.runtime_handle.spawn(serve_tcp(
        tcp_listener,
        handler.clone(),
        self.runtime_handle.clone(),
        cancel_token.child_token(),
      ));
    }

    cancel_token.cancelled().await;
    warn!("DNS responder cancelled");
    Ok(())
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug, Clone)]
/// Per-query resolution logic shared by the UDP and TCP listeners
struct DnsQueryHandler {
  host_table: DnsHostTable,
  upstream: SocketAddr,
  upstream_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
enum DnsTransport {
  Udp,
  Tcp,
}

impl DnsQueryHandler {
  /// Resolve one raw query message into raw response bytes.
  /// Names present in the host table are never forwarded upstream.
  async fn handle_query(&self, raw: &[u8], transport: DnsTransport) -> Option<Vec<u8>> {
    let query_msg = match Message::from_vec(raw) {
      Ok(m) => m,
      Err(e) => {
        debug!("Dropping undecodable DNS message: {e}");
        return None;
      }
    };
    let Some(query) = query_msg.queries().first().cloned() else {
      debug!("Dropping DNS message without question section");
      return None;
    };

    let name = normalize_host(&query.name().to_utf8());
    if let Some(addrs) = self.host_table.lookup(&name) {
      debug!("Answering {name} from local host table");
      return local_response(&query_msg, &query, &addrs).to_vec().ok();
    }

    match self.forward_upstream(raw, transport).await {
      Ok(response) => Some(response),
      Err(e) => {
        warn!("Upstream query for {name} failed: {e}");
        failure_response(&query_msg, &query).to_vec().ok()
      }
    }
  }

  /// Relay the raw query to the upstream resolver and return its raw answer
  async fn forward_upstream(&self, raw: &[u8], transport: DnsTransport) -> Result<Vec<u8>, DnsError> {
    match transport {
      DnsTransport::Udp => {
        let socket = UdpSocket::bind(unspecified_bind_addr(&self.upstream)).await?;
        socket.connect(self.upstream).await?;
        socket.send(raw).await?;
        let mut buf = vec![0u8; DNS_UDP_BUFFER_SIZE];
        let Ok(res) = timeout(self.upstream_timeout, socket.recv(&mut buf)).await else {
          return Err(DnsError::UpstreamTimeout);
        };
        let len = res?;
        buf.truncate(len);
        Ok(buf)
      }
      DnsTransport::Tcp => {
        let fut = async {
          let mut stream = TcpStream::connect(self.upstream).await?;
          stream.write_all(&(raw.len() as u16).to_be_bytes()).await?;
          stream.write_all(raw).await?;
          let mut len_buf = [0u8; 2];
          stream.read_exact(&mut len_buf).await?;
          let len = u16::from_be_bytes(len_buf) as usize;
          let mut buf = vec![0u8; len];
          stream.read_exact(&mut buf).await?;
          Ok::<_, DnsError>(buf)
        };
        let Ok(res) = timeout(self.upstream_timeout, fut).await else {
          return Err(DnsError::UpstreamTimeout);
        };
        res
      }
    }
  }
}

/// Answer A/AAAA queries for a known name from the table; a known name asked
/// with any other record type gets an empty NoError answer, never a forward.
fn local_response(query_msg: &Message, query: &Query, addrs: &BTreeSet<IpAddr>) -> Message {
  let mut response = response_skeleton(query_msg, query, ResponseCode::NoError);
  let name = query.name().clone();
  match query.query_type() {
    RecordType::A => {
      for addr in addrs {
        if let IpAddr::V4(v4) = addr {
          response.add_answer(Record::from_rdata(name.clone(), DNS_LOCAL_TTL_SEC, RData::A((*v4).into())));
        }
      }
    }
    RecordType::AAAA => {
      for addr in addrs {
        if let IpAddr::V6(v6) = addr {
          response.add_answer(Record::from_rdata(
            name.clone(),
            DNS_LOCAL_TTL_SEC,
            RData::AAAA((*v6).into()),
          ));
        }
      }
    }
    _ => {}
  }
  response
}

/// SERVFAIL relayed to the client when the upstream fails or times out
fn failure_response(query_msg: &Message, query: &Query) -> Message {
  response_skeleton(query_msg, query, ResponseCode::ServFail)
}

fn response_skeleton(query_msg: &Message, query: &Query, code: ResponseCode) -> Message {
  let mut response = Message::new();
  response
    .set_id(query_msg.id())
    .set_message_type(MessageType::Response)
    .set_op_code(query_msg.op_code())
    .set_authoritative(true)
    .set_recursion_desired(query_msg.recursion_desired())
    .set_recursion_available(true)
    .set_response_code(code);
  response.add_query(query.clone());
  response
}

/// Ephemeral local bind address in the upstream's address family
fn unspecified_bind_addr(upstream: &SocketAddr) -> SocketAddr {
  if upstream.is_ipv6() {
    SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0)
  } else {
    SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
  }
}

/* ---------------------------------------------------------- */
async fn serve_udp(
  socket: Arc<UdpSocket>,
  handler: DnsQueryHandler,
  runtime_handle: tokio::runtime::Handle,
  cancel_token: CancellationToken,
) {
  let mut buf = vec![0u8; DNS_UDP_BUFFER_SIZE];
  loop {
    let (len, src_addr) = tokio::select! {
      res = socket.recv_from(&mut buf) => match res {
        Ok(v) => v,
        Err(e) => {
          error!("Error in DNS UDP listener: {e}");
          continue;
        }
      },
      _ = cancel_token.cancelled() => {
        debug!("DNS UDP listener cancelled");
        return;
      }
    };
    let packet = buf[..len].to_vec();
    runtime_handle.spawn({
      let socket = Arc::clone(&socket);
      let handler = handler.clone();
      async move {
        if let Some(response) = handler.handle_query(&packet, DnsTransport::Udp).await {
          if let Err(e) = socket.send_to(&response, src_addr).await {
            warn!("Failed to send DNS response to {src_addr}: {e}");
          }
        }
      }
    });
  }
}

async fn serve_tcp(
  listener: TcpListener,
  handler: DnsQueryHandler,
  runtime_handle: tokio::runtime::Handle,
  cancel_token: CancellationToken,
) {
  loop {
    let (stream, src_addr) = tokio::select! {
      res = listener.accept() => match res {
        Ok(v) => v,
        Err(e) => {
          error!("Error in DNS TCP listener: {e}");
          continue;
        }
      },
      _ = cancel_token.cancelled() => {
        debug!("DNS TCP listener cancelled");
        return;
      }
    };
    runtime_handle.spawn({
      let handler = handler.clone();
      let cancel_token = cancel_token.clone();
      async move {
        tokio::select! {
          res = serve_tcp_connection(stream, handler) => {
            if let Err(e) = res {
              debug!("DNS TCP connection from {src_addr} closed: {e}");
            }
          }
          _ = cancel_token.cancelled() => {}
        }
      }
    });
  }
}

/// Handle length-prefixed queries on one TCP connection until the peer closes
async fn serve_tcp_connection(mut stream: TcpStream, handler: DnsQueryHandler) -> Result<(), DnsError> {
  loop {
    let mut len_buf = [0u8; 2];
    if stream.read_exact(&mut len_buf).await.is_err() {
      // Peer closed between messages
      return Ok(());
    }
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 {
      return Err(DnsError::TruncatedTcpMessage);
    }
    let mut raw = vec![0u8; len];
    stream.read_exact(&mut raw).await?;

    if let Some(response) = handler.handle_query(&raw, DnsTransport::Tcp).await {
      stream.write_all(&(response.len() as u16).to_be_bytes()).await?;
      stream.write_all(&response).await?;
    }
  }
}
