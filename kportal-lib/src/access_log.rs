use crate::{probe::RoutingKey, trace::info};
use std::net::SocketAddr;

/// Handle log for probed routing key, source and destination sockets
pub(crate) fn access_log(key: &RoutingKey, src_addr: &SocketAddr, dst_addr: &SocketAddr) {
  match &key.host {
    Some(host) => info!(
      name: crate::constants::log_event_names::ACCESS_LOG,
      "{} [{}]: {:?} -> {:?}", key.protocol, host, src_addr, dst_addr
    ),
    None => info!(
      name: crate::constants::log_event_names::ACCESS_LOG,
      "{}: {:?} -> {:?}", key.protocol, src_addr, dst_addr
    ),
  }
}
