//! Peer table: the live set of connections. Sole owner of `Session`
//! objects; sessions leave the table only on close or shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::SecondsFormat;
use parking_lot::Mutex;

use crate::message::PeerRecord;
use crate::session::Session;

struct TableInner {
    sessions: HashMap<u64, Arc<Session>>,
    /// Ring signature -> session id. Written under the same lock as the
    /// session map, so the handshake-to-trusted promotion is observed
    /// atomically: two concurrent handshakes for one signature cannot both
    /// win.
    claims: HashMap<Vec<u8>, u64>,
}

pub struct PeerTable {
    inner: Mutex<TableInner>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                sessions: HashMap::new(),
                claims: HashMap::new(),
            }),
        }
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.inner.lock().sessions.insert(session.id, session);
    }

    /// Remove a session and release any claim it holds.
    pub fn remove(&self, id: u64) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock();
        let session = inner.sessions.remove(&id);
        inner.claims.retain(|_, claimant| *claimant != id);
        session
    }

    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.inner.lock().sessions.get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    /// Claim a ring signature for the given session. The lookup and the
    /// marker write happen under one lock; exactly one of two simultaneous
    /// handshakes with the same peer wins. The claim is released when the
    /// session is removed.
    pub fn try_claim(&self, signature: &[u8], session_id: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.claims.contains_key(signature) {
            return false;
        }
        // A session that already left the table must not leave an orphan
        // claim behind.
        if !inner.sessions.contains_key(&session_id) {
            return false;
        }
        inner.claims.insert(signature.to_vec(), session_id);
        true
    }

    /// Sessions that completed the trust handshake.
    pub fn trusted(&self) -> Vec<Arc<Session>> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.is_trusted())
            .cloned()
            .collect()
    }

    pub fn trusted_count(&self) -> usize {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.is_trusted())
            .count()
    }

    /// Find a trusted session by ring signature.
    pub fn by_signature(&self, signature: &[u8]) -> Option<Arc<Session>> {
        self.inner
            .lock()
            .sessions
            .values()
            .find(|s| {
                s.is_trusted()
                    && s.ring_signature()
                        .map(|sig| sig == signature)
                        .unwrap_or(false)
            })
            .cloned()
    }

    /// True when the signature is claimed by a live connection, including a
    /// handshake still in flight.
    pub fn is_connected(&self, signature: &[u8]) -> bool {
        self.inner.lock().claims.contains_key(signature)
    }

    /// Serialize every trusted peer whose signature is not in `omit`,
    /// with the listening port appended when the stored address has none.
    pub fn peer_list(&self, omit: &[Vec<u8>]) -> Vec<PeerRecord> {
        let inner = self.inner.lock();
        let mut records = Vec::new();
        for session in inner.sessions.values() {
            if !session.is_trusted() {
                continue;
            }
            let Some(signature) = session.ring_signature() else {
                continue;
            };
            if omit.iter().any(|s| *s == signature) {
                continue;
            }
            let record = session.with_state(|state| {
                let mut address = state
                    .reported_address
                    .clone()
                    .unwrap_or_else(|| session.remote_host.clone());
                if !address.contains(':') {
                    if let Some(port) = state.reported_port {
                        address = format!("{}:{}", address, port);
                    }
                }
                PeerRecord {
                    address,
                    signature: BASE64.encode(&signature),
                    created: state
                        .created
                        .to_rfc3339_opts(SecondsFormat::Millis, true),
                    active: state.active.to_rfc3339_opts(SecondsFormat::Millis, true),
                    trusted: true,
                }
            });
            records.push(record);
        }
        records
    }

    /// Remove and return every session (shutdown path).
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let mut inner = self.inner.lock();
        inner.claims.clear();
        inner.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().sessions.is_empty()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Phase;
    use ringnet_crypto::SessionCipher;
    use tokio::sync::mpsc;

    fn trusted_session(host: &str, signature: &[u8]) -> Arc<Session> {
        let (tx, _rx) = mpsc::channel(8);
        let session = Session::new(host, false, tx);
        session.with_state(|s| {
            s.phase = Phase::Trusted;
            s.peer_signature = Some(signature.to_vec());
            s.tx = Some(SessionCipher::generate());
        });
        session
    }

    #[test]
    fn peer_list_skips_untrusted() {
        let table = PeerTable::new();
        let (tx, _rx) = mpsc::channel(8);
        table.insert(Session::new("10.0.0.1", false, tx));
        table.insert(trusted_session("10.0.0.2", b"sig-b"));

        let list = table.peer_list(&[]);
        assert_eq!(list.len(), 1);
        assert_eq!(table.trusted_count(), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn peer_list_honors_omit() {
        let table = PeerTable::new();
        table.insert(trusted_session("10.0.0.1", b"sig-a"));
        table.insert(trusted_session("10.0.0.2", b"sig-b"));

        let list = table.peer_list(&[b"sig-a".to_vec()]);
        assert_eq!(list.len(), 1);
        assert_eq!(
            list[0].signature,
            base64::engine::general_purpose::STANDARD.encode(b"sig-b")
        );
    }

    #[test]
    fn peer_list_appends_listening_port() {
        let table = PeerTable::new();
        let session = trusted_session("10.0.0.1", b"sig-a");
        session.with_state(|s| {
            s.reported_address = Some("10.0.0.1".into());
            s.reported_port = Some(26781);
        });
        table.insert(session);

        let list = table.peer_list(&[]);
        assert_eq!(list[0].address, "10.0.0.1:26781");
    }

    #[test]
    fn peer_list_keeps_address_with_port() {
        let table = PeerTable::new();
        let session = trusted_session("10.0.0.1", b"sig-a");
        session.with_state(|s| {
            s.reported_address = Some("10.0.0.1:9000".into());
            s.reported_port = Some(26781);
        });
        table.insert(session);

        assert_eq!(table.peer_list(&[])[0].address, "10.0.0.1:9000");
    }

    #[test]
    fn lookup_by_signature() {
        let table = PeerTable::new();
        let session = trusted_session("10.0.0.1", b"sig-a");
        let id = session.id;
        table.insert(session);
        assert!(table.try_claim(b"sig-a", id));

        assert!(table.is_connected(b"sig-a"));
        assert_eq!(table.by_signature(b"sig-a").unwrap().id, id);
        assert!(!table.is_connected(b"sig-z"));
    }

    #[test]
    fn claim_is_exclusive_per_signature() {
        let table = PeerTable::new();
        let first = trusted_session("10.0.0.1", b"sig-a");
        let second = trusted_session("10.0.0.2", b"sig-a");
        let first_id = first.id;
        let second_id = second.id;
        table.insert(first);
        table.insert(second);

        // Simultaneous handshakes with the same peer: exactly one wins.
        assert!(table.try_claim(b"sig-a", first_id));
        assert!(!table.try_claim(b"sig-a", second_id));

        // The claim is released with its session, after which the other
        // connection may promote.
        table.remove(first_id);
        assert!(!table.is_connected(b"sig-a"));
        assert!(table.try_claim(b"sig-a", second_id));
    }

    #[test]
    fn claim_requires_a_live_session() {
        let table = PeerTable::new();
        let session = trusted_session("10.0.0.1", b"sig-a");
        let id = session.id;
        table.insert(session);
        table.remove(id);

        assert!(!table.try_claim(b"sig-a", id));
        assert!(!table.is_connected(b"sig-a"));
    }

    #[test]
    fn drain_empties_the_table() {
        let table = PeerTable::new();
        let first = trusted_session("10.0.0.1", b"sig-a");
        let first_id = first.id;
        table.insert(first);
        table.insert(trusted_session("10.0.0.2", b"sig-b"));
        assert!(table.try_claim(b"sig-a", first_id));

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
        assert!(!table.is_connected(b"sig-a"));
    }
}
