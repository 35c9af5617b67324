//! Discovery: candidate addresses, normalization, and the FIFO dial queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Strip the IPv4-mapped IPv6 prefix. Applied once, where an address is
/// stored; comparison sites rely on already-normalized values.
pub fn normalize_host(host: &str) -> &str {
    host.strip_prefix("::ffff:").unwrap_or(host)
}

/// A candidate address decomposed for dialing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub scheme: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl DialTarget {
    /// Render a dialable URL, filling in scheme and port defaults.
    pub fn url(&self, default_scheme: &str, port: u16) -> String {
        let scheme = self.scheme.as_deref().unwrap_or(default_scheme);
        format!("{}://{}:{}", scheme, self.host, port)
    }
}

/// Parse an authority string with optional scheme and port.
pub fn parse_address(address: &str) -> DialTarget {
    let (scheme, rest) = match address.split_once("://") {
        Some((s, r)) => (Some(s.to_string()), r),
        None => (None, address),
    };
    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((h, p)) if !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => {
            (h, p.parse::<u16>().ok())
        }
        _ => (rest, None),
    };
    DialTarget {
        scheme,
        host: normalize_host(host).to_string(),
        port,
    }
}

/// A dialable peer address, optionally tagged with the peer's ring
/// signature when learned through gossip or reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub address: String,
    pub signature: Option<Vec<u8>>,
}

impl Candidate {
    /// Normalizes the address at construction so that membership checks
    /// compare equal for logically equivalent candidates.
    pub fn new(address: impl Into<String>, signature: Option<Vec<u8>>) -> Self {
        let raw: String = address.into();
        let address = match raw.split_once("://") {
            Some((scheme, rest)) => format!("{}://{}", scheme, normalize_host(rest)),
            None => normalize_host(&raw).to_string(),
        };
        Self { address, signature }
    }

    pub fn target(&self) -> DialTarget {
        parse_address(&self.address)
    }
}

/// FIFO queue of candidates plus the discovering flag.
pub struct DiscoveryQueue {
    queue: Mutex<VecDeque<Candidate>>,
    discovering: AtomicBool,
}

impl DiscoveryQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            discovering: AtomicBool::new(false),
        }
    }

    /// Append unless an equal candidate is already queued. Returns true when
    /// appended.
    pub fn push_unique(&self, candidate: Candidate) -> bool {
        let mut queue = self.queue.lock();
        if queue.iter().any(|c| *c == candidate) {
            return false;
        }
        queue.push_back(candidate);
        true
    }

    pub fn pop(&self) -> Option<Candidate> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Claim the discovery pass. Returns false when a pass is already
    /// running.
    pub fn begin(&self) -> bool {
        !self.discovering.swap(true, Ordering::SeqCst)
    }

    pub fn end(&self) {
        self.discovering.store(false, Ordering::SeqCst);
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::SeqCst)
    }
}

impl Default for DiscoveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_prefix_is_stripped() {
        assert_eq!(normalize_host("::ffff:192.168.1.5"), "192.168.1.5");
        assert_eq!(normalize_host("192.168.1.5"), "192.168.1.5");
        assert_eq!(normalize_host("example.org"), "example.org");
    }

    #[test]
    fn parse_bare_host() {
        let t = parse_address("example.org");
        assert_eq!(t.scheme, None);
        assert_eq!(t.host, "example.org");
        assert_eq!(t.port, None);
    }

    #[test]
    fn parse_host_and_port() {
        let t = parse_address("example.org:26781");
        assert_eq!(t.host, "example.org");
        assert_eq!(t.port, Some(26781));
    }

    #[test]
    fn parse_full_url() {
        let t = parse_address("wss://example.org:26781/");
        assert_eq!(t.scheme.as_deref(), Some("wss"));
        assert_eq!(t.host, "example.org");
        assert_eq!(t.port, Some(26781));
        assert_eq!(t.url("ws", 26781), "wss://example.org:26781");
    }

    #[test]
    fn parse_mapped_address_with_port() {
        let t = parse_address("::ffff:10.0.0.3:26781");
        assert_eq!(t.host, "10.0.0.3");
        assert_eq!(t.port, Some(26781));
    }

    #[test]
    fn url_applies_defaults() {
        let t = parse_address("example.org");
        assert_eq!(t.url("wss", 26781), "wss://example.org:26781");
    }

    #[test]
    fn candidate_normalization_deduplicates() {
        let queue = DiscoveryQueue::new();
        assert!(queue.push_unique(Candidate::new("::ffff:10.0.0.1:26781", None)));
        assert!(!queue.push_unique(Candidate::new("10.0.0.1:26781", None)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn candidates_differ_by_signature() {
        let queue = DiscoveryQueue::new();
        assert!(queue.push_unique(Candidate::new("10.0.0.1", Some(vec![1]))));
        assert!(queue.push_unique(Candidate::new("10.0.0.1", Some(vec![2]))));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn queue_is_fifo() {
        let queue = DiscoveryQueue::new();
        queue.push_unique(Candidate::new("a", None));
        queue.push_unique(Candidate::new("b", None));
        assert_eq!(queue.pop().unwrap().address, "a");
        assert_eq!(queue.pop().unwrap().address, "b");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn discovery_pass_claimed_once() {
        let queue = DiscoveryQueue::new();
        assert!(queue.begin());
        assert!(!queue.begin());
        queue.end();
        assert!(queue.begin());
    }
}
