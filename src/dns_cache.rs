use crate::dns::{self, QuestionKey};
use hashlink::LinkedHashMap;
use std::{
    net::SocketAddr,
    sync::Mutex,
    time::{Duration, Instant},
};

/// How often the background sweeper purges expired DNS entries.
pub const DNS_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Identity of one pending DNS transaction.
#[derive(Hash, Copy, Clone, Eq, PartialEq, Debug)]
pub struct DnsQueryKey {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub id: u16,
}

/// Where a resolved response has to be delivered.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DnsRoute {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub name: Option<String>,
}

/// Handle returned by [`DnsFlowCache::record`]. The sequence number keeps a
/// stale token from matching an entry recorded later under the same key.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DnsToken {
    key: DnsQueryKey,
    seq: u64,
}

impl DnsToken {
    pub fn key(&self) -> &DnsQueryKey {
        &self.key
    }
}

struct PendingQuery {
    route: DnsRoute,
    seq: u64,
    recorded_at: Instant,
}

struct FlowTable {
    next_seq: u64,
    entries: LinkedHashMap<DnsQueryKey, PendingQuery>,
}

/// Correlates DNS queries forwarded through the proxy with the responses
/// coming back, so each answer reaches the client that asked.
pub struct DnsFlowCache {
    timeout: Duration,
    table: Mutex<FlowTable>,
}

impl DnsFlowCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            table: Mutex::new(FlowTable {
                next_seq: 0,
                entries: LinkedHashMap::new(),
            }),
        }
    }

    /// Records a query if no live entry exists for `key`; otherwise returns the
    /// token of the entry already outstanding.
    pub fn record(&self, key: DnsQueryKey, route: DnsRoute) -> DnsToken {
        let now = Instant::now();
        let mut table = self.lock();

        if let Some(pending) = table.entries.get(&key) {
            if now.duration_since(pending.recorded_at) < self.timeout {
                return DnsToken { key, seq: pending.seq };
            }
            table.entries.remove(&key);
        }

        let seq = table.next_seq;
        table.next_seq += 1;
        let pending = PendingQuery {
            route,
            seq,
            recorded_at: now,
        };
        table.entries.insert(key, pending);
        DnsToken { key, seq }
    }

    /// Matches a response against the entry behind `token`. Unmatched, expired
    /// or undecodable responses are a miss.
    pub fn resolve(&self, token: &DnsToken, response: &[u8]) -> Option<DnsRoute> {
        let message = match dns::parse_data_to_dns_message(response, false) {
            Ok(message) => message,
            Err(err) => {
                log::debug!("undecodable DNS response for {:?}: {}", token.key, err);
                return None;
            }
        };
        if !dns::is_response(&message) || message.id() != token.key.id {
            return None;
        }

        let mut table = self.lock();
        match table.entries.get(&token.key) {
            Some(pending) if pending.seq == token.seq => {}
            _ => return None,
        }
        let pending = table.entries.remove(&token.key)?;
        if pending.recorded_at.elapsed() >= self.timeout {
            return None;
        }
        Some(pending.route)
    }

    /// Drops every entry older than the timeout and returns how many went.
    pub fn expire(&self) -> usize {
        let now = Instant::now();
        let mut table = self.lock();
        let mut removed = 0;
        // Entries are kept in insertion order, so the first live one ends the sweep.
        while let Some((_, pending)) = table.entries.front() {
            if now.duration_since(pending.recorded_at) < self.timeout {
                break;
            }
            table.entries.pop_front();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FlowTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct CachedAnswer {
    response: Vec<u8>,
    stored_at: Instant,
    expiry: Instant,
}

/// Short-lived cache of whole DNS responses keyed by question, honouring the
/// smallest answer TTL.
pub struct DnsAnswerCache {
    answers: Mutex<LinkedHashMap<QuestionKey, CachedAnswer>>,
}

impl Default for DnsAnswerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsAnswerCache {
    pub fn new() -> Self {
        Self {
            answers: Mutex::new(LinkedHashMap::new()),
        }
    }

    /// Returns a cached response for the question in `request`, rewritten to
    /// carry the request's transaction ID, with TTLs reduced by the time the
    /// answer has spent in the cache.
    pub fn query(&self, request: &[u8]) -> Option<Vec<u8>> {
        let message = dns::parse_data_to_dns_message(request, false).ok()?;
        let key = QuestionKey::from_message(&message)?;
        let (response, stored_at) = {
            let mut answers = self.lock();
            let cached = answers.get(&key)?;
            if Instant::now() >= cached.expiry {
                answers.remove(&key);
                return None;
            }
            (cached.response.clone(), cached.stored_at)
        };
        log::trace!("DNS answer cache hit for {}", key);
        dns::age_response(&response, stored_at.elapsed(), message.id()).ok()
    }

    pub fn store(&self, response: &[u8]) {
        let Ok(message) = dns::parse_data_to_dns_message(response, false) else {
            return;
        };
        let (Some(key), Some(ttl)) = (QuestionKey::from_message(&message), dns::min_answer_ttl(&message)) else {
            return;
        };
        if ttl == 0 {
            return;
        }
        let stored_at = Instant::now();
        let expiry = stored_at + Duration::from_secs(ttl as u64);
        let mut answers = self.lock();
        // Re-inserting moves the key to the back, keeping expiry roughly ordered.
        answers.remove(&key);
        answers.insert(
            key,
            CachedAnswer {
                response: response.to_vec(),
                stored_at,
                expiry,
            },
        );
    }

    pub fn expire(&self) -> usize {
        let now = Instant::now();
        let mut answers = self.lock();
        let before = answers.len();
        answers.retain(|_, cached| cached.expiry > now);
        before - answers.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkedHashMap<QuestionKey, CachedAnswer>> {
        self.answers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Purges expired entries from both caches every [`DNS_SWEEP_INTERVAL`]
/// until cancelled.
pub(crate) async fn sweep_dns_caches(
    flows: std::sync::Arc<DnsFlowCache>,
    answers: std::sync::Arc<DnsAnswerCache>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(DNS_SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let (flows_expired, answers_expired) = (flows.expire(), answers.expire());
        if flows_expired + answers_expired > 0 {
            log::trace!("DNS sweep expired {} pending queries and {} cached answers", flows_expired, answers_expired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tests::{build_query, build_response};
    use std::net::Ipv4Addr;

    fn key(id: u16) -> DnsQueryKey {
        DnsQueryKey {
            client: "10.0.0.2:53000".parse().unwrap(),
            server: "8.8.8.8:53".parse().unwrap(),
            id,
        }
    }

    fn route() -> DnsRoute {
        DnsRoute {
            client: "10.0.0.2:53000".parse().unwrap(),
            server: "8.8.8.8:53".parse().unwrap(),
            name: Some("example.org.".into()),
        }
    }

    fn response(id: u16) -> Vec<u8> {
        build_response(&build_query(id, "example.org."), Ipv4Addr::new(1, 2, 3, 4), 60)
    }

    #[test]
    fn record_then_resolve_returns_route() {
        let cache = DnsFlowCache::new(Duration::from_secs(30));
        let token = cache.record(key(7), route());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.resolve(&token, &response(7)), Some(route()));
        assert!(cache.is_empty());
        // A second response to the same transaction is unmatched.
        assert_eq!(cache.resolve(&token, &response(7)), None);
    }

    #[test]
    fn resolve_misses_on_wrong_id_or_garbage() {
        let cache = DnsFlowCache::new(Duration::from_secs(30));
        let token = cache.record(key(7), route());
        assert_eq!(cache.resolve(&token, &response(8)), None);
        assert_eq!(cache.resolve(&token, b"not dns"), None);
        assert_eq!(cache.resolve(&token, &build_query(7, "example.org.")), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn record_is_insert_if_absent() {
        let cache = DnsFlowCache::new(Duration::from_secs(30));
        let first = cache.record(key(1), route());
        let mut other = route();
        other.name = None;
        let second = cache.record(key(1), other);
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.resolve(&second, &response(1)), Some(route()));
    }

    #[test]
    fn expired_entries_miss_and_are_swept() {
        let cache = DnsFlowCache::new(Duration::from_millis(20));
        let token = cache.record(key(3), route());
        cache.record(key(4), route());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.resolve(&token, &response(3)), None);
        assert_eq!(cache.expire(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn stale_token_does_not_match_new_entry() {
        let cache = DnsFlowCache::new(Duration::from_millis(20));
        let stale = cache.record(key(5), route());
        std::thread::sleep(Duration::from_millis(40));
        let fresh = cache.record(key(5), route());
        assert_ne!(stale, fresh);
        assert_eq!(cache.resolve(&stale, &response(5)), None);
        assert_eq!(cache.resolve(&fresh, &response(5)), Some(route()));
    }

    #[test]
    fn concurrent_record_and_resolve() {
        let cache = std::sync::Arc::new(DnsFlowCache::new(Duration::from_secs(30)));
        let handles: Vec<_> = (0..8u16)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..50u16 {
                        let id = t * 100 + i;
                        let token = cache.record(key(id), route());
                        assert!(cache.resolve(&token, &response(id)).is_some());
                        cache.expire();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn answer_cache_rewrites_id() {
        let cache = DnsAnswerCache::new();
        cache.store(&response(1));
        let cached = cache.query(&build_query(99, "EXAMPLE.org.")).unwrap();
        assert_eq!(dns::message_id(&cached), Some(99));
        let message = hickory_proto::op::Message::from_vec(&cached).unwrap();
        assert!(message.answers()[0].ttl() <= 60);
        assert!(cache.query(&build_query(5, "other.org.")).is_none());
    }

    #[test]
    fn answer_cache_skips_empty_answers() {
        let cache = DnsAnswerCache::new();
        let mut message = hickory_proto::op::Message::from_vec(&build_query(1, "example.org.")).unwrap();
        message.set_message_type(hickory_proto::op::MessageType::Response);
        cache.store(&message.to_vec().unwrap());
        assert!(cache.is_empty());
        assert_eq!(cache.expire(), 0);
    }
}
