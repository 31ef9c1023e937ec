use crate::{
  constants::{ROUTING_KEY_PROBE_BUFFER_SIZE, ROUTING_KEY_PROBE_TIMEOUT_MSEC},
  error::ProxyError,
  http::{HttpProbeFailure, probe_http_host},
  tls::{TlsProbeFailure, probe_tls_handshake},
  trace::*,
};
use bytes::BytesMut;
use tokio::{
  io::AsyncReadExt,
  net::TcpStream,
  time::{Duration, timeout},
};

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Protocol carrying the routing key of an accepted connection
pub(crate) enum RoutingProtocol {
  /// TLS, keyed by the ClientHello SNI value
  Tls,
  /// Plaintext HTTP, keyed by the Host header
  Http,
  /// Anything else; only a fallback target can serve it
  Unknown,
}

impl std::fmt::Display for RoutingProtocol {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Tls => write!(f, "tls"),
      Self::Http => write!(f, "http"),
      Self::Unknown => write!(f, "tcp"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Routing key probed from the initial bytes of a connection
pub(crate) struct RoutingKey {
  pub(crate) protocol: RoutingProtocol,
  pub(crate) host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ProbeResult {
  Success(RoutingKey),
  PollNext,
  Failure,
}

fn probe_tls(buf: &[u8]) -> ProbeResult {
  match probe_tls_handshake(buf) {
    Ok(host) => ProbeResult::Success(RoutingKey {
      protocol: RoutingProtocol::Tls,
      host,
    }),
    Err(TlsProbeFailure::PollNext) => ProbeResult::PollNext,
    Err(TlsProbeFailure::Failure) => ProbeResult::Failure,
  }
}

fn probe_http(buf: &[u8]) -> ProbeResult {
  match probe_http_host(buf) {
    Ok(host) => ProbeResult::Success(RoutingKey {
      protocol: RoutingProtocol::Http,
      host,
    }),
    Err(HttpProbeFailure::PollNext) => ProbeResult::PollNext,
    Err(HttpProbeFailure::Failure) => ProbeResult::Failure,
  }
}

/* ---------------------------------------------------------- */
/// Read the initial bytes of the incoming stream until one probe succeeds or
/// all give up. The consumed bytes are left in `buf` so the caller can replay
/// them to the backend before splicing.
pub(crate) async fn probe_routing_key(
  incoming_stream: &mut TcpStream,
  buf: &mut BytesMut,
) -> Result<RoutingKey, ProxyError> {
  let mut probe_functions: Vec<fn(&[u8]) -> ProbeResult> = vec![probe_tls, probe_http];

  while !probe_functions.is_empty() && buf.len() < ROUTING_KEY_PROBE_BUFFER_SIZE {
    read_initial_bytes(incoming_stream, buf).await?;

    let mut remaining = Vec::new();
    for f in probe_functions {
      match f(buf) {
        ProbeResult::Success(key) => return Ok(key),
        ProbeResult::PollNext => remaining.push(f),
        ProbeResult::Failure => {}
      }
    }
    probe_functions = remaining;
  }

  debug!("Untyped TCP connection without routing key");
  Ok(RoutingKey {
    protocol: RoutingProtocol::Unknown,
    host: None,
  })
}

/// Poll the incoming TCP stream for more initial bytes, bounded by a timeout
async fn read_initial_bytes(incoming_stream: &mut TcpStream, buf: &mut BytesMut) -> Result<usize, ProxyError> {
  let read_fut = incoming_stream.read_buf(buf);
  let Ok(res) = timeout(Duration::from_millis(ROUTING_KEY_PROBE_TIMEOUT_MSEC), read_fut).await else {
    error!("Timeout to read the initial bytes of TCP stream");
    return Err(ProxyError::TimeOutToReadTcpStream);
  };
  let read_len = res?;
  if read_len == 0 {
    return Err(ProxyError::NoDataReceivedTcpStream);
  }
  Ok(read_len)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncWriteExt;
  use tokio::net::TcpListener;

  async fn probe_bytes(payload: &[u8]) -> (RoutingKey, BytesMut) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let payload = payload.to_vec();
    tokio::spawn(async move {
      let mut client = TcpStream::connect(addr).await.unwrap();
      client.write_all(&payload).await.unwrap();
      // Keep the write side open long enough for the probe to finish
      tokio::time::sleep(Duration::from_millis(200)).await;
    });
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = BytesMut::with_capacity(ROUTING_KEY_PROBE_BUFFER_SIZE);
    let key = probe_routing_key(&mut stream, &mut buf).await.unwrap();
    (key, buf)
  }

  #[tokio::test]
  async fn test_probe_http_host() {
    let (key, buf) = probe_bytes(b"GET / HTTP/1.1\r\nHost: web.demo.svc.cluster.local\r\n\r\n").await;
    assert_eq!(key.protocol, RoutingProtocol::Http);
    assert_eq!(key.host.as_deref(), Some("web.demo.svc.cluster.local"));
    assert!(buf.starts_with(b"GET /"));
  }

  #[tokio::test]
  async fn test_probe_tls_sni() {
    let record = crate::tls::tests::sample_client_hello("foo.demo.example.com");
    let (key, buf) = probe_bytes(&record).await;
    assert_eq!(key.protocol, RoutingProtocol::Tls);
    assert_eq!(key.host.as_deref(), Some("foo.demo.example.com"));
    assert_eq!(&buf[..], &record[..]);
  }

  #[tokio::test]
  async fn test_probe_unknown_protocol() {
    let (key, _) = probe_bytes(b"SSH-2.0-OpenSSH_8.3\r\nsome more banner data here").await;
    assert_eq!(key.protocol, RoutingProtocol::Unknown);
    assert!(key.host.is_none());
  }
}
