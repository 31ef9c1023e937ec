use crate::trace::*;

/* ---------------------------------------------------------- */
const TLS_RECORD_HEADER_LEN: usize = 5;
const TLS_HANDSHAKE_CONTENT_TYPE: u8 = 0x16;
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const TLS_EXTENSION_TYPE_SNI: usize = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Why the TLS probe did not yield a ClientHello
pub(crate) enum TlsProbeFailure {
  /// The buffer does not hold the whole record yet
  PollNext,
  /// The buffer is not a TLS handshake
  Failure,
}

/// Probe the buffer for a TLS ClientHello and extract the SNI host name, if present.
/// The record layout checks are inspired by https://github.com/yrutschle/sslh/blob/master/tls.c
pub(crate) fn probe_tls_handshake(buf: &[u8]) -> Result<Option<String>, TlsProbeFailure> {
  // TLS record header: https://datatracker.ietf.org/doc/html/rfc8446#section-5.1
  // - content type: 1 byte
  // - version: 2 bytes
  // - length: 2 bytes
  if buf.len() < TLS_RECORD_HEADER_LEN {
    return Err(TlsProbeFailure::PollNext);
  }
  if buf[0] != TLS_HANDSHAKE_CONTENT_TYPE {
    return Err(TlsProbeFailure::Failure);
  }
  // Initial ClientHello carries the legacy version for interoperability, like 0x03 0x01 = TLS 1.0
  if buf[1] < 3 {
    // Omit the legacy SSL
    return Err(TlsProbeFailure::Failure);
  }
  let payload_len = ((buf[3] as usize) << 8) + buf[4] as usize;
  if buf.len() < TLS_RECORD_HEADER_LEN + payload_len {
    debug!("Probe buffer does not hold the whole TLS record yet");
    return Err(TlsProbeFailure::PollNext);
  }

  probe_client_hello(&buf[TLS_RECORD_HEADER_LEN..TLS_RECORD_HEADER_LEN + payload_len])
}

/// Walk a ClientHello handshake message and pull the SNI host name out of its extensions.
/// https://datatracker.ietf.org/doc/html/rfc8446#page-24
fn probe_client_hello(buf: &[u8]) -> Result<Option<String>, TlsProbeFailure> {
  if buf.is_empty() || buf[0] != TLS_HANDSHAKE_TYPE_CLIENT_HELLO {
    return Err(TlsProbeFailure::Failure);
  }
  // Skip past fixed length records:
  // -- Handshake --
  //  - 1 Handshake Type
  //  - 3 Length
  // -- ClientHello --
  //  - 2  Version (again)
  //  - 32 Random
  let mut pos = 38;
  if buf.len() < pos + 1 {
    return Err(TlsProbeFailure::Failure);
  }

  // Session ID
  let session_id_len = buf[pos] as usize;
  pos += 1 + session_id_len;
  if buf.len() < pos + 2 {
    return Err(TlsProbeFailure::Failure);
  }

  // Cipher Suites
  let cipher_suites_len = ((buf[pos] as usize) << 8) + buf[pos + 1] as usize;
  if cipher_suites_len < 2 || cipher_suites_len % 2 != 0 {
    return Err(TlsProbeFailure::Failure);
  }
  pos += 2 + cipher_suites_len;
  if buf.len() < pos + 1 {
    return Err(TlsProbeFailure::Failure);
  }

  // Compression Methods
  let compression_methods_len = buf[pos] as usize;
  if compression_methods_len < 1 {
    return Err(TlsProbeFailure::Failure);
  }
  pos += 1 + compression_methods_len;
  if buf.len() < pos + 2 {
    // A ClientHello without extensions cannot carry SNI anyway
    return Ok(None);
  }

  // Extensions: https://datatracker.ietf.org/doc/html/rfc8446#section-4.2
  let extensions_len = ((buf[pos] as usize) << 8) + buf[pos + 1] as usize;
  pos += 2;
  let mut cnt = 0;
  while cnt + 4 <= extensions_len {
    if buf.len() < pos + 4 {
      return Err(TlsProbeFailure::Failure);
    }
    let extension_type = ((buf[pos] as usize) << 8) + buf[pos + 1] as usize;
    let extension_len = ((buf[pos + 2] as usize) << 8) + buf[pos + 3] as usize;
    pos += 4;
    cnt += 4;
    if buf.len() < pos + extension_len {
      return Err(TlsProbeFailure::Failure);
    }
    if extension_type == TLS_EXTENSION_TYPE_SNI {
      debug!("Found Server Name Indication extension");
      return match parse_sni(&buf[pos..pos + extension_len]) {
        Ok(sni) => Ok(Some(sni)),
        Err(_) => Err(TlsProbeFailure::Failure),
      };
    }
    pos += extension_len;
    cnt += extension_len;
  }

  debug!("TLS ClientHello without SNI extension");
  Ok(None)
}

/// Parse the first host name from the SNI extension payload
fn parse_sni(buf: &[u8]) -> Result<String, anyhow::Error> {
  if buf.len() < 2 {
    return Err(anyhow::anyhow!("Invalid SNI extension"));
  }
  // byte length of the server name list payload
  let server_name_list_len = ((buf[0] as usize) << 8) + buf[1] as usize;
  let mut pos = 2;

  while pos + 3 <= buf.len() {
    let name_type = buf[pos];
    let len = ((buf[pos + 1] as usize) << 8) + buf[pos + 2] as usize;
    if buf.len() < pos + 3 + len {
      return Err(anyhow::anyhow!("Invalid SNI extension"));
    }
    match name_type {
      0x00 => {
        // host_name
        let name = String::from_utf8_lossy(&buf[pos + 3..pos + 3 + len]).to_ascii_lowercase();
        return Ok(name);
      }
      _ => {
        debug!("Unknown SNI name type: {:x}", name_type);
      }
    }
    pos += 3 + len;
  }

  if pos != server_name_list_len + 2 {
    return Err(anyhow::anyhow!("Invalid SNI extension"));
  }
  Err(anyhow::anyhow!("No SNI host name found"))
}
