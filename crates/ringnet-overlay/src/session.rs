//! Per-connection session: transport handle plus trust state, session
//! ciphers, reported listening endpoint, and unconfirmed sends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ringnet_crypto::{CryptoError, CryptoResult, RsaPublicKey, SessionCipher};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{OverlayError, OverlayResult};
use crate::message::FrameType;
use crate::transport::NORMAL_CLOSE;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames queued for the connection's writer task.
#[derive(Debug)]
pub enum Outgoing {
    Text(String),
    Close(u16),
}

/// Trust state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the remote HELO
    AwaitHelo,
    /// Ring membership verified, session material issued
    Trusted,
    /// Terminal
    Closed,
}

/// A sent message awaiting its CONFIRM.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub hash: String,
    pub timestamp: String,
    pub kind: FrameType,
    pub body: Value,
}

/// Mutable session state, guarded by one mutex per connection.
pub struct SessionState {
    pub phase: Phase,
    /// Remote long-term public key (set on verified HELO)
    pub peer_public: Option<RsaPublicKey>,
    /// Remote ring signature (set on verified HELO)
    pub peer_signature: Option<Vec<u8>>,
    /// Material we generated; encrypts our outbound frames
    pub tx: Option<SessionCipher>,
    /// Material the remote generated; decrypts inbound frames
    pub rx: Option<SessionCipher>,
    /// Listening endpoint the remote advertised in TRUSTED
    pub reported_address: Option<String>,
    pub reported_port: Option<u16>,
    /// Whether the remote asked for per-message confirmation
    pub peer_requires_confirmation: bool,
    pub unconfirmed: Vec<PendingSend>,
    pub created: DateTime<Utc>,
    pub active: DateTime<Utc>,
}

/// A live connection. Owned by the peer table; all crypto material and
/// bookkeeping lives here rather than on the transport handle.
pub struct Session {
    pub id: u64,
    /// Remote host with the IPv4-mapped prefix stripped at storage time
    pub remote_host: String,
    pub outbound: bool,
    sender: mpsc::Sender<Outgoing>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(remote_host: &str, outbound: bool, sender: mpsc::Sender<Outgoing>) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            remote_host: crate::discovery::normalize_host(remote_host).to_string(),
            outbound,
            sender,
            state: Mutex::new(SessionState {
                phase: Phase::AwaitHelo,
                peer_public: None,
                peer_signature: None,
                tx: None,
                rx: None,
                reported_address: None,
                reported_port: None,
                peer_requires_confirmation: false,
                unconfirmed: Vec::new(),
                created: now,
                active: now,
            }),
        })
    }

    /// Queue a text frame for the connection's writer task.
    pub async fn send_text(&self, text: String) -> OverlayResult<()> {
        self.sender
            .send(Outgoing::Text(text))
            .await
            .map_err(|_| OverlayError::ChannelClosed)
    }

    /// Queue a close frame and mark the session terminal.
    pub async fn close(&self, code: u16) {
        self.state.lock().phase = Phase::Closed;
        let _ = self.sender.send(Outgoing::Close(code)).await;
    }

    /// Close with the normal-closure code.
    pub async fn close_normal(&self) {
        self.close(NORMAL_CLOSE).await;
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn is_trusted(&self) -> bool {
        self.phase() == Phase::Trusted
    }

    pub fn ring_signature(&self) -> Option<Vec<u8>> {
        self.state.lock().peer_signature.clone()
    }

    pub fn peer_public(&self) -> Option<RsaPublicKey> {
        self.state.lock().peer_public.clone()
    }

    pub fn peer_requires_confirmation(&self) -> bool {
        self.state.lock().peer_requires_confirmation
    }

    pub fn touch(&self) {
        self.state.lock().active = Utc::now();
    }

    /// Run `f` under the state lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Promote to TRUSTED after a verified HELO: record the remote identity
    /// and the material this side generated.
    pub fn record_trust(
        &self,
        peer_public: RsaPublicKey,
        peer_signature: Vec<u8>,
        tx: SessionCipher,
    ) {
        let mut state = self.state.lock();
        state.peer_public = Some(peer_public);
        state.peer_signature = Some(peer_signature);
        state.tx = Some(tx);
        state.phase = Phase::Trusted;
        state.active = Utc::now();
    }

    /// Record the remote's TRUSTED payload: its session material and
    /// advertised endpoint.
    pub fn record_remote_material(
        &self,
        rx: SessionCipher,
        requires_confirmation: bool,
        address: Option<String>,
        port: Option<u16>,
    ) {
        let mut state = self.state.lock();
        state.rx = Some(rx);
        state.peer_requires_confirmation = requires_confirmation;
        state.reported_address =
            address.map(|a| crate::discovery::normalize_host(&a).to_string());
        state.reported_port = port;
        state.active = Utc::now();
    }

    /// Encrypt a plaintext body with this direction's material.
    pub fn seal(&self, plaintext: &[u8]) -> Option<String> {
        self.state.lock().tx.as_ref().map(|c| c.encrypt_b64(plaintext))
    }

    /// Decrypt an inbound base64 body.
    pub fn open(&self, body: &str) -> CryptoResult<Vec<u8>> {
        let state = self.state.lock();
        match &state.rx {
            Some(cipher) => cipher.decrypt_b64(body),
            None => Err(CryptoError::Decrypt),
        }
    }

    pub fn push_unconfirmed(&self, pending: PendingSend) {
        self.state.lock().unconfirmed.push(pending);
    }

    /// Remove one matching (hash, timestamp) entry, scanning from the tail.
    /// Returns true when an entry was removed; a second identical CONFIRM is
    /// a no-op.
    pub fn confirm(&self, hash: &str, timestamp: &str) -> bool {
        let mut state = self.state.lock();
        if let Some(pos) = state
            .unconfirmed
            .iter()
            .rposition(|p| p.hash == hash && p.timestamp == timestamp)
        {
            state.unconfirmed.remove(pos);
            return true;
        }
        false
    }

    /// Remove and return a pending entry if it is still unconfirmed; read at
    /// retry-fire time, not at schedule time.
    pub fn take_pending(&self, hash: &str, timestamp: &str) -> Option<PendingSend> {
        let mut state = self.state.lock();
        let pos = state
            .unconfirmed
            .iter()
            .rposition(|p| p.hash == hash && p.timestamp == timestamp)?;
        Some(state.unconfirmed.remove(pos))
    }

    pub fn unconfirmed_len(&self) -> usize {
        self.state.lock().unconfirmed.len()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_host", &self.remote_host)
            .field("outbound", &self.outbound)
            .field("phase", &state.phase)
            .field("unconfirmed", &state.unconfirmed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_session() -> Arc<Session> {
        let (tx, _rx) = mpsc::channel(8);
        Session::new("127.0.0.1", false, tx)
    }

    fn pending(hash: &str, ts: &str) -> PendingSend {
        PendingSend {
            hash: hash.into(),
            timestamp: ts.into(),
            kind: FrameType::Message,
            body: json!("x"),
        }
    }

    #[test]
    fn starts_awaiting_helo() {
        let session = test_session();
        assert_eq!(session.phase(), Phase::AwaitHelo);
        assert!(!session.is_trusted());
    }

    #[test]
    fn mapped_prefix_stripped_at_construction() {
        let (tx, _rx) = mpsc::channel(8);
        let session = Session::new("::ffff:10.0.0.7", true, tx);
        assert_eq!(session.remote_host, "10.0.0.7");
    }

    #[test]
    fn confirm_removes_exactly_one_entry() {
        let session = test_session();
        session.push_unconfirmed(pending("h1", "t1"));
        session.push_unconfirmed(pending("h2", "t2"));

        assert!(session.confirm("h1", "t1"));
        assert_eq!(session.unconfirmed_len(), 1);
        // Idempotent: the same CONFIRM again changes nothing.
        assert!(!session.confirm("h1", "t1"));
        assert_eq!(session.unconfirmed_len(), 1);
    }

    #[test]
    fn confirm_requires_exact_pair() {
        let session = test_session();
        session.push_unconfirmed(pending("h1", "t1"));
        assert!(!session.confirm("h1", "t-other"));
        assert!(!session.confirm("h-other", "t1"));
        assert_eq!(session.unconfirmed_len(), 1);
    }

    #[test]
    fn take_pending_reads_current_state() {
        let session = test_session();
        session.push_unconfirmed(pending("h1", "t1"));
        assert!(session.take_pending("h1", "t1").is_some());
        assert!(session.take_pending("h1", "t1").is_none());
    }

    #[test]
    fn seal_and_open_use_recorded_material() {
        let session = test_session();
        assert!(session.seal(b"data").is_none());

        let tx = SessionCipher::generate();
        let rx = SessionCipher::generate();
        session.with_state(|s| {
            s.tx = Some(tx.clone());
            s.rx = Some(rx.clone());
        });

        let sealed = session.seal(b"data").unwrap();
        assert_eq!(tx.decrypt_b64(&sealed).unwrap(), b"data");

        let inbound = rx.encrypt_b64(b"reply");
        assert_eq!(session.open(&inbound).unwrap(), b"reply");
    }
}
