//! Address and on-disk state helpers for the consensus transport.

use std::net::{IpAddr, TcpListener};
use std::path::Path;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Files and directories the consensus core keeps under its data dir.
pub const LOG_DB: &str = "raft-log.db";
pub const STABLE_DB: &str = "raft-stable.db";
pub const SNAPSHOT_DIR: &str = "snapshots";

const CLUSTER_KEY_LEN: usize = 32;

pub fn valid_ip(ip: &str) -> bool {
    ip.parse::<IpAddr>().is_ok()
}

/// `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Host part of `host:port`, with IPv6 brackets removed.
pub fn split_host(addr: &str) -> Option<&str> {
    let (host, port) = addr.rsplit_once(':')?;
    if port.parse::<u16>().is_err() {
        return None;
    }
    Some(host.trim_start_matches('[').trim_end_matches(']'))
}

/// The HTTP API address of a peer, given its Raft address.
pub fn api_address(raft_addr: &str, api_port: u16) -> Option<String> {
    split_host(raft_addr).map(|host| join_host_port(host, api_port))
}

/// Check that `ip:port` can be bound right now.
pub fn try_bind(ip: &str, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(join_host_port(ip, port))?;
    drop(listener);
    Ok(())
}

/// True when a previous log, stable store or snapshot exists under `dir`.
pub fn raft_state_exists(dir: &Path) -> bool {
    if dir.join(LOG_DB).exists() || dir.join(STABLE_DB).exists() {
        return true;
    }
    match std::fs::read_dir(dir.join(SNAPSHOT_DIR)) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}

/// Remove every piece of consensus state and recreate an empty dir.
pub fn clear_raft_state(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::create_dir_all(dir)
}

pub fn generate_cluster_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CLUSTER_KEY_LEN)
        .map(char::from)
        .collect()
}
