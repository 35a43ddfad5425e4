// The MIT License (MIT)

// Copyright (c) 2020 jumptiger project developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Registry of live connections and flow counters
//!
//! Every accepted socket gets exactly one record for its lifetime, held via
//! an RAII guard so teardown can never leak an entry. The registry is the
//! data source behind the monitoring endpoint; snapshots are plain copies
//! taken under a short lock and never block the relays.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

/// Lifecycle of a proxied connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Negotiating,
    Connecting,
    Relaying,
    Closing,
    Closed,
}

impl ConnState {
    fn as_u8(self) -> u8 {
        match self {
            ConnState::Negotiating => 0,
            ConnState::Connecting => 1,
            ConnState::Relaying => 2,
            ConnState::Closing => 3,
            ConnState::Closed => 4,
        }
    }

    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Negotiating,
            1 => ConnState::Connecting,
            2 => ConnState::Relaying,
            3 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConnState::Negotiating => "negotiating",
            ConnState::Connecting => "connecting",
            ConnState::Relaying => "relaying",
            ConnState::Closing => "closing",
            ConnState::Closed => "closed",
        }
    }
}

/// Shared, atomically updatable record of one live connection
pub struct ConnRecord {
    id: u64,
    client_addr: SocketAddr,
    started_at: Instant,
    target: Mutex<Option<String>>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    state: AtomicU8,
}

impl ConnRecord {
    fn new(id: u64, client_addr: SocketAddr) -> ConnRecord {
        ConnRecord {
            id,
            client_addr,
            started_at: Instant::now(),
            target: Mutex::new(None),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            state: AtomicU8::new(ConnState::Negotiating.as_u8()),
        }
    }
}

/// Process-wide concurrent map of live connections plus aggregate counters
pub struct ConnRegistry {
    start_time: Instant,
    next_id: AtomicU64,
    total_connections: AtomicU64,
    total_bytes_in: AtomicU64,
    total_bytes_out: AtomicU64,
    conns: Mutex<HashMap<u64, Arc<ConnRecord>>>,
}

impl ConnRegistry {
    pub fn new() -> ConnRegistry {
        ConnRegistry {
            start_time: Instant::now(),
            next_id: AtomicU64::new(1),
            total_connections: AtomicU64::new(0),
            total_bytes_in: AtomicU64::new(0),
            total_bytes_out: AtomicU64::new(0),
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Admits a connection if the live count is below `max_connections`.
    ///
    /// Returns `None` when the cap is reached; the caller drops the socket
    /// without replying. The admission check and the insert happen under one
    /// lock so a burst of accepts cannot overshoot the cap.
    pub fn try_register(
        self: Arc<Self>,
        client_addr: SocketAddr,
        max_connections: u32,
    ) -> Option<ConnGuard> {
        let record = {
            let mut conns = self.conns.lock().unwrap();
            if conns.len() >= max_connections as usize {
                return None;
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let record = Arc::new(ConnRecord::new(id, client_addr));
            conns.insert(id, record.clone());
            record
        };

        self.total_connections.fetch_add(1, Ordering::Relaxed);

        Some(ConnGuard {
            registry: self,
            record,
        })
    }

    pub fn active_connections(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn total_bytes_in(&self) -> u64 {
        self.total_bytes_in.load(Ordering::Relaxed)
    }

    pub fn total_bytes_out(&self) -> u64 {
        self.total_bytes_out.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of the registry for monitoring consumers
    pub fn snapshot(&self) -> Snapshot {
        let connections: Vec<ConnSnapshot> = {
            let conns = self.conns.lock().unwrap();
            conns.values().map(|record| ConnSnapshot::of(record)).collect()
        };

        Snapshot {
            total_connections: self.total_connections(),
            active_connections: connections.len() as u64,
            total_bytes_in: self.total_bytes_in(),
            total_bytes_out: self.total_bytes_out(),
            uptime: self.start_time.elapsed().as_secs(),
            connections,
        }
    }

    fn remove(&self, id: u64) {
        self.conns.lock().unwrap().remove(&id);
    }
}

impl Default for ConnRegistry {
    fn default() -> ConnRegistry {
        ConnRegistry::new()
    }
}

/// RAII handle owned by a connection's handler task.
///
/// Dropping the guard removes the record from the registry and marks it
/// closed, which keeps the "registered iff not closed" invariant even on
/// panics and cancelled tasks.
pub struct ConnGuard {
    registry: Arc<ConnRegistry>,
    record: Arc<ConnRecord>,
}

impl ConnGuard {
    pub fn id(&self) -> u64 {
        self.record.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.record.client_addr
    }

    pub fn set_state(&self, state: ConnState) {
        self.record.state.store(state.as_u8(), Ordering::Relaxed);
    }

    pub fn set_target<T: ToString>(&self, target: &T) {
        *self.record.target.lock().unwrap() = Some(target.to_string());
    }

    /// Bytes flowing toward the accepted client
    pub fn add_bytes_in(&self, n: u64) {
        self.record.bytes_in.fetch_add(n, Ordering::Relaxed);
        self.registry.total_bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    /// Bytes flowing away from the accepted client
    pub fn add_bytes_out(&self, n: u64) {
        self.record.bytes_out.fetch_add(n, Ordering::Relaxed);
        self.registry.total_bytes_out.fetch_add(n, Ordering::Relaxed);
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.record.state.store(ConnState::Closed.as_u8(), Ordering::Relaxed);
        self.registry.remove(self.record.id);
    }
}

/// One connection as reported by the stats API
#[derive(Clone, Debug, Serialize)]
pub struct ConnSnapshot {
    pub id: u64,
    pub client_addr: String,
    pub target: Option<String>,
    pub state: &'static str,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub age_sec: u64,
}

impl ConnSnapshot {
    fn of(record: &ConnRecord) -> ConnSnapshot {
        ConnSnapshot {
            id: record.id,
            client_addr: record.client_addr.to_string(),
            target: record.target.lock().unwrap().clone(),
            state: ConnState::from_u8(record.state.load(Ordering::Relaxed)).name(),
            bytes_in: record.bytes_in.load(Ordering::Relaxed),
            bytes_out: record.bytes_out.load(Ordering::Relaxed),
            age_sec: record.started_at.elapsed().as_secs(),
        }
    }
}

/// Point-in-time view of the whole registry
#[derive(Clone, Debug, Serialize)]
pub struct Snapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub uptime: u64,
    pub connections: Vec<ConnSnapshot>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn client() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn register_and_drop_balances() {
        let registry = Arc::new(ConnRegistry::new());
        assert_eq!(registry.active_connections(), 0);

        let guard = registry.clone().try_register(client(), 8).unwrap();
        assert_eq!(registry.active_connections(), 1);
        assert_eq!(registry.total_connections(), 1);

        drop(guard);
        assert_eq!(registry.active_connections(), 0);
        // totals are monotonic and survive teardown
        assert_eq!(registry.total_connections(), 1);
    }

    #[test]
    fn admission_cap_is_enforced() {
        let registry = Arc::new(ConnRegistry::new());
        let a = registry.clone().try_register(client(), 2).unwrap();
        let _b = registry.clone().try_register(client(), 2).unwrap();
        assert!(registry.clone().try_register(client(), 2).is_none());

        drop(a);
        assert!(registry.clone().try_register(client(), 2).is_some());
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let registry = Arc::new(ConnRegistry::new());
        let a = registry.clone().try_register(client(), 8).unwrap();
        let b = registry.clone().try_register(client(), 8).unwrap();
        assert!(b.id() > a.id());
    }

    #[test]
    fn byte_counters_accumulate() {
        let registry = Arc::new(ConnRegistry::new());
        let guard = registry.clone().try_register(client(), 8).unwrap();
        guard.set_target(&"example.com:443");
        guard.set_state(ConnState::Relaying);
        guard.add_bytes_in(100);
        guard.add_bytes_in(23);
        guard.add_bytes_out(7);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.total_bytes_in, 123);
        assert_eq!(snapshot.total_bytes_out, 7);

        let conn = &snapshot.connections[0];
        assert_eq!(conn.bytes_in, 123);
        assert_eq!(conn.bytes_out, 7);
        assert_eq!(conn.state, "relaying");
        assert_eq!(conn.target.as_deref(), Some("example.com:443"));

        drop(guard);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.total_bytes_in, 123);
    }

    #[test]
    fn snapshot_serializes_with_expected_field_names() {
        let registry = Arc::new(ConnRegistry::new());
        let json = serde_json::to_value(&registry.snapshot()).unwrap();
        for key in &[
            "total_connections",
            "active_connections",
            "total_bytes_in",
            "total_bytes_out",
            "uptime",
            "connections",
        ] {
            assert!(json.get(*key).is_some(), "missing key {}", key);
        }
    }
}
