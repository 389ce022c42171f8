// src/stats.rs
//
// Process-wide counters behind one value owned by the server context: the
// peer-IP registry (active count per normalized IP plus every IP ever seen),
// the live connection gauge, and the request counter feeding /status.json.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Local;
use serde::Serialize;

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Default)]
struct IpRegistry {
    active: HashMap<String, u32>,
    seen: HashSet<String>,
}

pub struct Stats {
    start_time: u64,
    total_requests: AtomicU64,
    connections: AtomicI64,
    ips: Mutex<IpRegistry>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            start_time: unix_now(),
            total_requests: AtomicU64::new(0),
            connections: AtomicI64::new(0),
            ips: Mutex::new(IpRegistry::default()),
        }
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_count(&self) -> i64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// A connection from `ip` was accepted.
    pub fn on_connect(&self, ip: &str) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        if ip.is_empty() {
            return;
        }
        let mut ips = self.ips.lock().unwrap();
        *ips.active.entry(ip.to_string()).or_insert(0) += 1;
        ips.seen.insert(ip.to_string());
    }

    /// The connection from `ip` closed; the active entry vanishes at zero.
    pub fn on_disconnect(&self, ip: &str) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
        if ip.is_empty() {
            return;
        }
        let mut ips = self.ips.lock().unwrap();
        decrement(&mut ips.active, ip);
    }

    /// A forwarding header replaced the peer address mid-request.
    pub fn replace_ip(&self, old: &str, new: &str) {
        if new.is_empty() || old == new {
            return;
        }
        let mut ips = self.ips.lock().unwrap();
        if !old.is_empty() {
            decrement(&mut ips.active, old);
        }
        *ips.active.entry(new.to_string()).or_insert(0) += 1;
        ips.seen.insert(new.to_string());
    }

    pub fn active_ip_count(&self, ip: &str) -> u32 {
        let ips = self.ips.lock().unwrap();
        ips.active.get(ip).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let uptime = unix_now().saturating_sub(self.start_time);
        let qps = if uptime > 0 {
            total as f64 / uptime as f64
        } else {
            total as f64
        };
        let (online_users, total_unique_visitors) = {
            let ips = self.ips.lock().unwrap();
            (ips.active.len(), ips.seen.len())
        };
        StatusSnapshot {
            uptime_seconds: uptime,
            online_users,
            online_connections: self.connection_count().max(0) as u64,
            total_unique_visitors,
            total_requests: total,
            avg_qps: (qps * 100.0).round() / 100.0,
            server_time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

fn decrement(active: &mut HashMap<String, u32>, ip: &str) {
    if let Some(count) = active.get_mut(ip) {
        if *count <= 1 {
            active.remove(ip);
        } else {
            *count -= 1;
        }
    }
}

/// Stable wire shape of `/status.json`; field order follows the declaration.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub uptime_seconds: u64,
    pub online_users: usize,
    pub online_connections: u64,
    pub total_unique_visitors: usize,
    pub total_requests: u64,
    pub avg_qps: f64,
    pub server_time: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_and_disconnect_balance() {
        let stats = Stats::new();
        stats.on_connect("1.2.3.4");
        stats.on_connect("1.2.3.4");
        stats.on_connect("local");
        assert_eq!(stats.connection_count(), 3);
        assert_eq!(stats.active_ip_count("1.2.3.4"), 2);

        stats.on_disconnect("1.2.3.4");
        assert_eq!(stats.active_ip_count("1.2.3.4"), 1);
        stats.on_disconnect("1.2.3.4");
        // entry vanishes once the count reaches zero
        assert_eq!(stats.active_ip_count("1.2.3.4"), 0);
        stats.on_disconnect("local");
        assert_eq!(stats.connection_count(), 0);

        // unique set remembers both peers
        let snap = stats.snapshot();
        assert_eq!(snap.total_unique_visitors, 2);
        assert_eq!(snap.online_users, 0);
    }

    #[test]
    fn replace_ip_moves_the_active_entry() {
        let stats = Stats::new();
        stats.on_connect("local");
        stats.replace_ip("local", "8.8.8.8");
        assert_eq!(stats.active_ip_count("local"), 0);
        assert_eq!(stats.active_ip_count("8.8.8.8"), 1);
        assert_eq!(stats.connection_count(), 1);
    }

    #[test]
    fn snapshot_serializes_in_contract_order() {
        let stats = Stats::new();
        stats.record_request();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        let uptime_pos = json.find("uptime_seconds").unwrap();
        let users_pos = json.find("online_users").unwrap();
        let conns_pos = json.find("online_connections").unwrap();
        let unique_pos = json.find("total_unique_visitors").unwrap();
        let total_pos = json.find("total_requests").unwrap();
        let qps_pos = json.find("avg_qps").unwrap();
        let time_pos = json.find("server_time").unwrap();
        assert!(uptime_pos < users_pos);
        assert!(users_pos < conns_pos);
        assert!(conns_pos < unique_pos);
        assert!(unique_pos < total_pos);
        assert!(total_pos < qps_pos);
        assert!(qps_pos < time_pos);
        assert!(json.contains("\"total_requests\":1"));
    }
}
