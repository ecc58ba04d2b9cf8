//! Per-connection classification state.
//!
//! Every TCP flow seen on the inspection queue gets one entry. An entry
//! starts `Pending` and moves at most once, to `Allowed` or `Blocked`.
//! Pending flows are let through for a grace period so the handshake can
//! progress far enough to expose a hostname.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::allow_list::{is_allowed, AllowSet};
use crate::extract::{extract_http_host, extract_tls_sni};
use crate::firewall::{HTTPS_PORT, HTTP_PORT};
use crate::packet::TcpSegment;
use crate::queue::Verdict;

/// Identity of one TCP flow as seen on the outbound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionTuple {
    pub source: IpAddr,
    pub source_port: u16,
    pub destination: IpAddr,
    pub destination_port: u16,
}

impl fmt::Display for ConnectionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            std::net::SocketAddr::new(self.source, self.source_port),
            std::net::SocketAddr::new(self.destination, self.destination_port)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Pending,
    Allowed,
    Blocked,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FlowState::Pending)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionState {
    state: FlowState,
    first_seen: Instant,
    last_seen: Instant,
    hostname: Option<String>,
}

impl ConnectionState {
    fn new(now: Instant) -> Self {
        Self {
            state: FlowState::Pending,
            first_seen: now,
            last_seen: now,
            hostname: None,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn first_seen(&self) -> Instant {
        self.first_seen
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Leave `Pending`. Terminal states never change.
    fn resolve(&mut self, to: FlowState) {
        debug_assert!(to.is_terminal());
        if self.state == FlowState::Pending {
            self.state = to;
        }
    }
}

/// Knobs for the classification path.
#[derive(Debug, Clone, Copy)]
pub struct TrackingPolicy {
    pub grace_period: Duration,
    pub max_entries: usize,
    pub idle_timeout: Duration,
}

impl Default for TrackingPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            max_entries: 65_536,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Connection table plus the allow-set it is judged against. Both live
/// behind the same lock.
#[derive(Debug, Default)]
pub struct FilterState {
    allow: AllowSet,
    connections: HashMap<ConnectionTuple, ConnectionState>,
    policy: TrackingPolicy,
}

impl FilterState {
    pub fn new(policy: TrackingPolicy) -> Self {
        Self {
            allow: AllowSet::default(),
            connections: HashMap::new(),
            policy,
        }
    }

    pub fn allow_set(&self) -> &AllowSet {
        &self.allow
    }

    /// Replace the allow-set. Existing entries are kept; callers clear them.
    pub fn set_allow_set(&mut self, allow: AllowSet) {
        self.allow = allow;
    }

    pub fn clear(&mut self) {
        self.connections.clear();
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn get(&self, tuple: &ConnectionTuple) -> Option<&ConnectionState> {
        self.connections.get(tuple)
    }

    /// Decide the fate of one TCP segment at time `now`.
    pub fn classify(&mut self, segment: &TcpSegment<'_>, now: Instant) -> Verdict {
        let tuple = segment.tuple;
        if !self.connections.contains_key(&tuple) {
            self.make_room(now);
        }

        let grace_period = self.policy.grace_period;
        let entry = self
            .connections
            .entry(tuple)
            .or_insert_with(|| ConnectionState::new(now));
        entry.last_seen = now;

        match entry.state {
            FlowState::Allowed => return Verdict::Accept,
            FlowState::Blocked => return Verdict::Drop,
            FlowState::Pending => {}
        }

        if segment.is_connection_open() {
            trace!(%tuple, "connection open, waiting for handshake");
            return Verdict::Accept;
        }

        if let Some(hostname) = hostname_for(segment) {
            let verdict = if is_allowed(&hostname, &self.allow) {
                entry.resolve(FlowState::Allowed);
                Verdict::Accept
            } else {
                entry.resolve(FlowState::Blocked);
                Verdict::Drop
            };
            debug!(%tuple, hostname = %hostname, ?verdict, "connection classified");
            entry.hostname = Some(hostname);
            return verdict;
        }

        if now.saturating_duration_since(entry.first_seen) > grace_period {
            entry.resolve(FlowState::Blocked);
            debug!(%tuple, "no hostname within grace period, blocking");
            return Verdict::Drop;
        }

        trace!(%tuple, "not yet classifiable, passing provisionally");
        Verdict::Accept
    }

    /// Mark a flow blocked after its packet could not be inspected.
    pub fn fail_closed(&mut self, tuple: &ConnectionTuple, now: Instant) -> Verdict {
        let grace_period = self.policy.grace_period;
        match self.connections.get_mut(tuple) {
            Some(entry) if entry.state == FlowState::Pending => {
                if now.saturating_duration_since(entry.first_seen) > grace_period {
                    entry.resolve(FlowState::Blocked);
                    Verdict::Drop
                } else {
                    Verdict::Accept
                }
            }
            Some(entry) if entry.state == FlowState::Allowed => Verdict::Accept,
            _ => Verdict::Drop,
        }
    }

    /// Keep the table under `max_entries`.
    ///
    /// Idle entries go first. If that is not enough, terminal entries and then
    /// pending ones are evicted oldest first, down to a low-water mark so the
    /// next sweep is at least `max_entries / 8` insertions away.
    fn make_room(&mut self, now: Instant) {
        let max_entries = self.policy.max_entries;
        if self.connections.len() < max_entries {
            return;
        }
        let low_water = max_entries - (max_entries / 8).max(1);

        let idle_timeout = self.policy.idle_timeout;
        let before = self.connections.len();
        self.connections
            .retain(|_, c| now.saturating_duration_since(c.last_seen) <= idle_timeout);
        let idle = before - self.connections.len();

        let excess = self.connections.len().saturating_sub(low_water);
        if excess > 0 {
            let mut victims: Vec<_> = self
                .connections
                .iter()
                .map(|(tuple, c)| (c.state == FlowState::Pending, c.last_seen, *tuple))
                .collect();
            victims.select_nth_unstable_by_key(excess - 1, |&(pending, seen, _)| (pending, seen));
            for (_, _, tuple) in &victims[..excess] {
                self.connections.remove(tuple);
            }
        }

        warn!(
            idle,
            forced = excess,
            remaining = self.connections.len(),
            "connection table full, evicted entries"
        );
    }
}

fn hostname_for(segment: &TcpSegment<'_>) -> Option<String> {
    if segment.payload.is_empty() {
        return None;
    }
    match segment.tuple.destination_port {
        HTTP_PORT => extract_http_host(segment.payload),
        HTTPS_PORT => extract_tls_sni(segment.payload),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::tests::client_hello;
    use std::net::Ipv4Addr;

    const SYN: (bool, bool) = (true, false);
    const ACK: (bool, bool) = (false, true);

    fn tuple(sport: u16, dport: u16) -> ConnectionTuple {
        ConnectionTuple {
            source: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            source_port: sport,
            destination: IpAddr::V4(Ipv4Addr::new(140, 82, 112, 3)),
            destination_port: dport,
        }
    }

    fn segment(tuple: ConnectionTuple, flags: (bool, bool), payload: &[u8]) -> TcpSegment<'_> {
        TcpSegment {
            tuple,
            syn: flags.0,
            ack: flags.1,
            payload,
        }
    }

    fn state_with(domains: &[&str]) -> FilterState {
        let mut state = FilterState::new(TrackingPolicy::default());
        state.set_allow_set(AllowSet::from_domains(domains.iter().copied()));
        state
    }

    #[test]
    fn test_sni_allowed_flow() {
        let mut state = state_with(&["example.com"]);
        let t = tuple(50000, 443);
        let now = Instant::now();
        let hello = client_hello(Some("example.com"));

        assert_eq!(state.classify(&segment(t, SYN, b""), now), Verdict::Accept);
        assert_eq!(state.get(&t).unwrap().state(), FlowState::Pending);

        assert_eq!(state.classify(&segment(t, ACK, &hello), now), Verdict::Accept);
        let entry = state.get(&t).unwrap();
        assert_eq!(entry.state(), FlowState::Allowed);
        assert_eq!(entry.hostname(), Some("example.com"));

        // Allowed is sticky, even long after the grace period.
        let later = now + Duration::from_secs(60);
        assert_eq!(state.classify(&segment(t, ACK, b"\x17\x03\x03"), later), Verdict::Accept);
        assert_eq!(state.classify(&segment(t, ACK, b""), later), Verdict::Accept);
    }

    #[test]
    fn test_empty_allow_set_blocks() {
        let mut state = state_with(&[]);
        let t = tuple(50001, 443);
        let now = Instant::now();
        let hello = client_hello(Some("example.com"));

        assert_eq!(state.classify(&segment(t, ACK, &hello), now), Verdict::Drop);
        assert_eq!(state.get(&t).unwrap().state(), FlowState::Blocked);
        assert_eq!(state.classify(&segment(t, ACK, b""), now), Verdict::Drop);
        assert_eq!(state.classify(&segment(t, SYN, b""), now), Verdict::Drop);
    }

    #[test]
    fn test_http_host_classification() {
        let mut state = state_with(&["github.com"]);
        let now = Instant::now();

        let ok = tuple(50002, 80);
        let req = b"GET / HTTP/1.1\r\nHost: api.github.com\r\n\r\n";
        assert_eq!(state.classify(&segment(ok, ACK, req), now), Verdict::Accept);
        assert_eq!(state.get(&ok).unwrap().state(), FlowState::Allowed);

        let bad = tuple(50003, 80);
        let req = b"GET / HTTP/1.1\r\nHost: github.com.evil.com\r\n\r\n";
        assert_eq!(state.classify(&segment(bad, ACK, req), now), Verdict::Drop);
        assert_eq!(state.get(&bad).unwrap().state(), FlowState::Blocked);
    }

    #[test]
    fn test_extractor_follows_destination_port() {
        let mut state = state_with(&["example.com"]);
        let now = Instant::now();
        // An HTTP request sent to 443 is not a ClientHello.
        let t = tuple(50004, 443);
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(state.classify(&segment(t, ACK, req), now), Verdict::Accept);
        assert_eq!(state.get(&t).unwrap().state(), FlowState::Pending);
    }

    #[test]
    fn test_grace_period_expiry() {
        let mut state = state_with(&["example.com"]);
        let t = tuple(50005, 443);
        let start = Instant::now();

        assert_eq!(state.classify(&segment(t, SYN, b""), start), Verdict::Accept);
        assert_eq!(
            state.classify(&segment(t, ACK, b""), start + Duration::from_millis(1500)),
            Verdict::Accept
        );
        assert_eq!(
            state.classify(&segment(t, ACK, b""), start + Duration::from_millis(2001)),
            Verdict::Drop
        );
        assert_eq!(state.get(&t).unwrap().state(), FlowState::Blocked);

        // A late ClientHello cannot reopen a blocked flow.
        let hello = client_hello(Some("example.com"));
        assert_eq!(
            state.classify(&segment(t, ACK, &hello), start + Duration::from_secs(3)),
            Verdict::Drop
        );
    }

    #[test]
    fn test_partial_hello_within_grace_passes() {
        let mut state = state_with(&["example.com"]);
        let t = tuple(50006, 443);
        let now = Instant::now();
        let hello = client_hello(Some("example.com"));

        let half = &hello[..hello.len() / 2];
        assert_eq!(state.classify(&segment(t, ACK, half), now), Verdict::Accept);
        assert_eq!(state.get(&t).unwrap().state(), FlowState::Pending);
    }

    #[test]
    fn test_clear_forgets_flows() {
        let mut state = state_with(&[]);
        let t = tuple(50007, 443);
        let now = Instant::now();
        let hello = client_hello(Some("example.com"));
        assert_eq!(state.classify(&segment(t, ACK, &hello), now), Verdict::Drop);

        state.set_allow_set(AllowSet::from_domains(["example.com"]));
        state.clear();
        assert!(state.is_empty());
        assert_eq!(state.classify(&segment(t, ACK, &hello), now), Verdict::Accept);
    }

    #[test]
    fn test_allow_set_change_is_prospective() {
        let mut state = state_with(&[]);
        let t = tuple(50008, 443);
        let now = Instant::now();
        let hello = client_hello(Some("example.com"));
        assert_eq!(state.classify(&segment(t, ACK, &hello), now), Verdict::Drop);

        // Without clearing, the blocked flow stays blocked.
        state.set_allow_set(AllowSet::from_domains(["example.com"]));
        assert_eq!(state.classify(&segment(t, ACK, &hello), now), Verdict::Drop);
    }

    #[test]
    fn test_sweep_evicts_idle_entries() {
        let policy = TrackingPolicy {
            max_entries: 2,
            idle_timeout: Duration::from_secs(10),
            ..TrackingPolicy::default()
        };
        let mut state = FilterState::new(policy);
        let start = Instant::now();

        state.classify(&segment(tuple(1, 443), SYN, b""), start);
        state.classify(&segment(tuple(2, 443), SYN, b""), start + Duration::from_secs(8));
        state.classify(&segment(tuple(3, 443), SYN, b""), start + Duration::from_secs(15));

        assert_eq!(state.len(), 2);
        assert!(state.get(&tuple(1, 443)).is_none());
        assert!(state.get(&tuple(2, 443)).is_some());
    }

    #[test]
    fn test_table_bounded_when_nothing_idle() {
        let policy = TrackingPolicy {
            max_entries: 4,
            ..TrackingPolicy::default()
        };
        let mut state = FilterState::new(policy);
        let now = Instant::now();

        for port in 1..=1000 {
            let t = tuple(port, 443);
            assert_eq!(state.classify(&segment(t, SYN, b""), now), Verdict::Accept);
            assert!(state.len() <= 4);
            assert!(state.get(&t).is_some());
        }
    }

    #[test]
    fn test_forced_eviction_prefers_terminal_entries() {
        let policy = TrackingPolicy {
            max_entries: 3,
            ..TrackingPolicy::default()
        };
        let mut state = FilterState::new(policy);
        state.set_allow_set(AllowSet::from_domains(["example.com"]));
        let start = Instant::now();
        let hello = client_hello(Some("example.com"));

        // Oldest entry is still pending, the newer one is already allowed.
        state.classify(&segment(tuple(1, 443), SYN, b""), start);
        state.classify(&segment(tuple(2, 443), ACK, &hello), start + Duration::from_millis(10));
        state.classify(&segment(tuple(3, 443), SYN, b""), start + Duration::from_millis(20));
        assert_eq!(state.get(&tuple(2, 443)).unwrap().state(), FlowState::Allowed);

        state.classify(&segment(tuple(4, 443), SYN, b""), start + Duration::from_millis(30));
        assert_eq!(state.len(), 3);
        assert!(state.get(&tuple(2, 443)).is_none());
        assert!(state.get(&tuple(1, 443)).is_some());
        assert!(state.get(&tuple(4, 443)).is_some());
    }

    #[test]
    fn test_fail_closed() {
        let mut state = state_with(&[]);
        let start = Instant::now();
        let t = tuple(50009, 443);

        assert_eq!(state.fail_closed(&t, start), Verdict::Drop);

        state.classify(&segment(t, SYN, b""), start);
        assert_eq!(state.fail_closed(&t, start + Duration::from_secs(1)), Verdict::Accept);
        assert_eq!(state.fail_closed(&t, start + Duration::from_secs(3)), Verdict::Drop);
        assert_eq!(state.get(&t).unwrap().state(), FlowState::Blocked);
    }
}
