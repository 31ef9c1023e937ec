use crate::route::normalize_host;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Why the HTTP probe did not yield a Host header
pub(crate) enum HttpProbeFailure {
  /// The header section is not complete yet
  PollNext,
  /// The buffer is not a plaintext HTTP request
  Failure,
}

/// Probe the buffer for a plaintext HTTP request head and extract the Host
/// header value, stripped of any port suffix.
pub(crate) fn probe_http_host(buf: &[u8]) -> Result<Option<String>, HttpProbeFailure> {
  if buf.len() < 16 {
    return Err(HttpProbeFailure::PollNext);
  }
  let text = String::from_utf8_lossy(buf);

  let Some(request_line) = text.split("\r\n").next() else {
    return Err(HttpProbeFailure::PollNext);
  };
  if !text.contains("\r\n") {
    // No complete request line yet; an HTTP method is short, give up early
    // if the start already cannot be one.
    return if request_line.len() > 128 {
      Err(HttpProbeFailure::Failure)
    } else {
      Err(HttpProbeFailure::PollNext)
    };
  }
  if !request_line.contains("HTTP/") {
    return Err(HttpProbeFailure::Failure);
  }

  let headers_complete = text.contains("\r\n\r\n");
  // The last split element is either empty or a line still in flight; only
  // lines already terminated by CRLF may be parsed.
  let lines: Vec<&str> = text.split("\r\n").collect();
  for line in &lines[1..lines.len() - 1] {
    if line.is_empty() {
      break;
    }
    let Some((name, value)) = line.split_once(':') else {
      continue;
    };
    if name.trim().eq_ignore_ascii_case("host") {
      // Routing keys are host names; drop an optional :port suffix. A
      // bracketed IPv6 literal keeps its colons, e.g. `[::1]:8080`.
      let value = value.trim();
      let host = if let Some(v6_literal) = value.strip_prefix('[') {
        v6_literal.split(']').next().unwrap_or_default()
      } else {
        value.split(':').next().unwrap_or_default()
      };
      if host.is_empty() {
        return Ok(None);
      }
      return Ok(Some(normalize_host(host)));
    }
  }

  if headers_complete {
    // Well-formed request without a Host header
    Ok(None)
  } else {
    Err(HttpProbeFailure::PollNext)
  }
}
