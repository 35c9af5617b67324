//! The overlay service: listener, trust handshake, discovery, broadcast.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use ringnet_crypto::{public_key_from_pem, verify_with, CryptoError, Identity, SessionCipher};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::discovery::{Candidate, DiscoveryQueue};
use crate::error::{OverlayError, OverlayResult};
use crate::message::{
    canonical, hash_for, now_timestamp, ConfirmTag, Envelope, FrameType, Header, HeloBody,
    Listening, PeerRecord, TrustedBody, RESERVED_NAMES,
};
use crate::session::{Outgoing, PendingSend, Phase, Session};
use crate::table::PeerTable;
use crate::transport::{
    close_code, close_message, dial, Listener, StreamIo, TlsIdentity, ABNORMAL_CLOSE,
    NORMAL_CLOSE,
};

/// Close code for malformed or out-of-order frames.
const PROTOCOL_CLOSE: u16 = 1002;
/// Close code for admission and verification failures.
const POLICY_CLOSE: u16 = 1008;

/// Default listen port when `RINGNET_LISTEN` is unset.
pub const DEFAULT_PORT: u16 = 26781;
/// Default port-expansion range for port-less candidates.
pub const DEFAULT_DISCOVERY_RANGE: (u16, u16) = (26780, 26790);

/// Startup configuration.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Listen port; 0 binds an OS-assigned port.
    pub port: u16,
    /// Address advertised to peers in TRUSTED.
    pub public_address: Option<String>,
    /// Initial candidate list.
    pub discovery_addresses: Vec<Candidate>,
    /// Inclusive port range for expanding port-less candidates.
    pub discovery_range: Option<(u16, u16)>,
    /// Begin discovery immediately after start.
    pub start_discovery: bool,
    /// Demand per-message confirmation and retry until confirmed.
    pub require_confirmation: bool,
    /// Scheme used for candidates that carry none.
    pub default_scheme: String,
    /// TLS certificate/key for the listener; plain `ws` when absent.
    pub tls: Option<TlsIdentity>,
    /// Delay before rebroadcasting an unconfirmed message.
    pub confirm_retry: Duration,
    /// Delay before the discovery restart that follows an abnormal close.
    pub reconnect_delay: Duration,
    /// Event channel capacity.
    pub event_buffer: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            public_address: None,
            discovery_addresses: Vec::new(),
            discovery_range: Some(DEFAULT_DISCOVERY_RANGE),
            start_discovery: true,
            require_confirmation: false,
            default_scheme: "wss".to_string(),
            tls: None,
            confirm_retry: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(60),
            event_buffer: 1024,
        }
    }
}

fn default_port() -> u16 {
    std::env::var("RINGNET_LISTEN")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

/// A decrypted, verified application frame.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub kind: FrameType,
    pub body: Value,
    /// Ring signature of the sending peer
    pub from: Vec<u8>,
    pub hash: String,
    pub timestamp: String,
}

/// Events surfaced to the embedder.
#[derive(Debug, Clone)]
pub enum OverlayEvent {
    /// Listener bound
    Ready { port: u16 },
    /// A discovery pass started
    Discovering,
    /// The discovery queue drained
    Discovered,
    /// An inbound transport connection arrived (pre-trust)
    Request { remote_addr: String },
    /// A peer completed the trust handshake in both directions
    Connection { signature: Vec<u8> },
    /// An application frame arrived; embedder-defined types appear here
    /// with their name in `Delivery::kind`
    Message(Delivery),
}

/// The overlay service handle.
pub struct Overlay {
    config: Arc<OverlayConfig>,
    identity: Arc<Identity>,
    table: Arc<PeerTable>,
    queue: Arc<DiscoveryQueue>,
    event_tx: mpsc::Sender<OverlayEvent>,
    event_rx: Option<mpsc::Receiver<OverlayEvent>>,
    running: Arc<RwLock<bool>>,
    listen_port: Arc<RwLock<u16>>,
    accept_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    reader_tasks: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

impl Overlay {
    pub fn new(config: OverlayConfig, identity: Identity) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            config: Arc::new(config),
            identity: Arc::new(identity),
            table: Arc::new(PeerTable::new()),
            queue: Arc::new(DiscoveryQueue::new()),
            event_tx,
            event_rx: Some(event_rx),
            running: Arc::new(RwLock::new(false)),
            listen_port: Arc::new(RwLock::new(0)),
            accept_task: Arc::new(Mutex::new(None)),
            reader_tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Take the event receiver (once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<OverlayEvent>> {
        self.event_rx.take()
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    /// The bound listen port (meaningful after `start`).
    pub fn listen_port(&self) -> u16 {
        *self.listen_port.read()
    }

    /// This peer's ring signature.
    pub fn signature(&self) -> Vec<u8> {
        self.identity.ring_signature().to_vec()
    }

    /// Number of trusted peers.
    pub fn peer_count(&self) -> usize {
        self.table.trusted_count()
    }

    /// Serialized trusted-peer list, omitting the given signatures.
    pub fn peer_list(&self, omit: &[Vec<u8>]) -> Vec<PeerRecord> {
        self.table.peer_list(omit)
    }

    /// Unconfirmed sends currently pending toward the peer with `signature`.
    pub fn unconfirmed_to(&self, signature: &[u8]) -> usize {
        self.table
            .by_signature(signature)
            .map(|s| s.unconfirmed_len())
            .unwrap_or(0)
    }

    /// Bind the listener, start accepting, and (optionally) begin discovery.
    pub async fn start(&self) -> OverlayResult<()> {
        if *self.running.read() {
            return Err(OverlayError::AlreadyRunning);
        }

        let listener = Listener::bind(self.config.port, self.config.tls.as_ref()).await?;
        let port = listener.local_port()?;
        *self.listen_port.write() = port;
        *self.running.write() = true;
        info!("listening on port {}", port);

        let this = self.clone_handle();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((ws, addr)) => {
                        let _ = this
                            .event_tx
                            .send(OverlayEvent::Request {
                                remote_addr: addr.to_string(),
                            })
                            .await;
                        this.clone_handle()
                            .spawn_connection(ws, addr.ip().to_string(), false);
                    }
                    Err(e) => {
                        if !*this.running.read() {
                            break;
                        }
                        warn!("accept error: {}", e);
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(handle);

        let _ = self.event_tx.send(OverlayEvent::Ready { port }).await;

        for candidate in &self.config.discovery_addresses {
            self.queue.push_unique(candidate.clone());
        }
        if self.config.start_discovery && !self.queue.is_empty() {
            let this = self.clone_handle();
            tokio::spawn(async move { this.run_discovery().await });
        }

        Ok(())
    }

    /// Feed candidates and start a discovery pass if one is not running.
    pub async fn discover(&self, candidates: Vec<Candidate>) {
        let mut added = false;
        for candidate in candidates {
            if let Some(sig) = &candidate.signature {
                if self.identity.is_own_signature(sig) || self.table.is_connected(sig) {
                    continue;
                }
            }
            if self.queue.push_unique(candidate) {
                added = true;
            }
        }
        if added && !self.queue.is_discovering() {
            let this = self.clone_handle();
            tokio::spawn(async move { this.run_discovery().await });
        }
    }

    /// Publish an application message to every trusted peer.
    pub async fn broadcast(&self, kind: FrameType, body: Value) -> OverlayResult<()> {
        if !*self.running.read() {
            return Err(OverlayError::NotRunning);
        }
        if matches!(kind, FrameType::Helo | FrameType::Trusted) {
            return Err(OverlayError::InvalidFrame(format!(
                "{} frames are handshake-only",
                kind
            )));
        }
        for session in self.table.trusted() {
            self.send_data(&session, kind.clone(), &body, None).await;
        }
        Ok(())
    }

    /// Publish to the single trusted peer with the given ring signature.
    pub async fn broadcast_to(
        &self,
        signature: &[u8],
        kind: FrameType,
        body: Value,
    ) -> OverlayResult<()> {
        if !*self.running.read() {
            return Err(OverlayError::NotRunning);
        }
        if matches!(kind, FrameType::Helo | FrameType::Trusted) {
            return Err(OverlayError::InvalidFrame(format!(
                "{} frames are handshake-only",
                kind
            )));
        }
        let session = self
            .table
            .by_signature(signature)
            .ok_or_else(|| OverlayError::PeerNotFound(BASE64.encode(signature)))?;
        self.send_data(&session, kind, &body, None).await;
        Ok(())
    }

    /// Graceful shutdown: close every connection with the normal code, then
    /// stop the listener. Not restartable afterwards.
    pub async fn close(&self) {
        if !*self.running.read() {
            return;
        }
        *self.running.write() = false;
        for session in self.table.drain() {
            session.close_normal().await;
        }
        if let Some(handle) = self.accept_task.lock().take() {
            handle.abort();
        }
        info!("overlay shut down");
    }

    /// Hard stop without close frames: connections are torn down at the TCP
    /// level so remote peers observe an abnormal closure. Simulates a crash.
    pub fn halt(&self) {
        *self.running.write() = false;
        if let Some(handle) = self.accept_task.lock().take() {
            handle.abort();
        }
        for (_, handle) in self.reader_tasks.lock().drain() {
            handle.abort();
        }
        self.table.drain();
    }

    fn clone_handle(&self) -> Self {
        Self {
            config: self.config.clone(),
            identity: self.identity.clone(),
            table: self.table.clone(),
            queue: self.queue.clone(),
            event_tx: self.event_tx.clone(),
            event_rx: None,
            running: self.running.clone(),
            listen_port: self.listen_port.clone(),
            accept_task: self.accept_task.clone(),
            reader_tasks: self.reader_tasks.clone(),
        }
    }

    /// Register a connection: spawn its writer and reader tasks and open the
    /// handshake with our HELO.
    fn spawn_connection<S: StreamIo + 'static>(
        self,
        ws: WebSocketStream<S>,
        remote_host: String,
        outbound: bool,
    ) {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Outgoing>(64);
        let session = Session::new(&remote_host, outbound, tx);
        self.table.insert(session.clone());

        tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                match out {
                    Outgoing::Text(text) => {
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            debug!("write failed: {}", e);
                            break;
                        }
                    }
                    Outgoing::Close(code) => {
                        let _ = sink.send(close_message(code, "")).await;
                        let _ = sink.flush().await;
                        break;
                    }
                }
            }
        });

        let session_id = session.id;
        let this = self.clone_handle();
        let reader = tokio::spawn(async move {
            this.send_helo(&session).await;

            let mut code = ABNORMAL_CLOSE;
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => this.handle_frame(&session, &text).await,
                    Ok(WsMessage::Close(frame)) => {
                        code = close_code(frame.as_ref());
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("read error from {}: {}", session.remote_host, e);
                        break;
                    }
                }
            }

            this.reader_tasks.lock().remove(&session.id);
            this.handle_close(&session, code).await;
        });
        let mut tasks = self.reader_tasks.lock();
        if !reader.is_finished() {
            tasks.insert(session_id, reader);
        }
    }

    async fn send_helo(&self, session: &Arc<Session>) {
        let body = HeloBody {
            public_key: self.identity.public_key_pem().to_string(),
            signature: self.identity.ring_signature_b64(),
        };
        let body = match serde_json::to_value(&body) {
            Ok(v) => v,
            Err(e) => {
                warn!("HELO serialization failed: {}", e);
                return;
            }
        };
        let env = Envelope::new(FrameType::Helo, body);
        if let Err(e) = session.send_text(env.to_text()).await {
            debug!("HELO send failed to {}: {}", session.remote_host, e);
        }
    }

    async fn handle_frame(&self, session: &Arc<Session>, text: &str) {
        let env = match Envelope::from_text(text) {
            Ok(env) => env,
            Err(e) => {
                warn!("unparseable frame from {}: {}", session.remote_host, e);
                if !session.is_trusted() {
                    session.close(PROTOCOL_CLOSE).await;
                }
                return;
            }
        };

        match env.header.kind.clone() {
            FrameType::Helo => self.handle_helo(session, env).await,
            FrameType::Trusted => self.handle_trusted(session, env).await,
            _ => self.handle_data(session, env).await,
        }
    }

    /// HELO: verify the admission ticket and answer with TRUSTED carrying
    /// freshly generated session material and our peer list.
    async fn handle_helo(&self, session: &Arc<Session>, env: Envelope) {
        let Ok(body) = serde_json::from_value::<HeloBody>(env.body) else {
            session.close(PROTOCOL_CLOSE).await;
            return;
        };
        let Ok(signature) = BASE64.decode(body.signature.trim()) else {
            session.close(PROTOCOL_CLOSE).await;
            return;
        };

        if self.identity.is_own_signature(&signature) {
            debug!("self-connect via {}, closing", session.remote_host);
            session.close_normal().await;
            return;
        }
        if session.is_trusted() {
            // Duplicate HELO on an established connection.
            return;
        }
        let Ok(peer_public) = public_key_from_pem(&body.public_key) else {
            session.close(PROTOCOL_CLOSE).await;
            return;
        };
        if !self.identity.verify_ring(&body.public_key, &signature) {
            warn!("admission rejected for {}", session.remote_host);
            session.close(POLICY_CLOSE).await;
            return;
        }
        // Claim the signature and promote in one step: with a mutual dial,
        // both connections verify the same HELO concurrently and exactly one
        // may reach TRUSTED.
        if !self.table.try_claim(&signature, session.id) {
            debug!(
                "already connected to peer behind {}, closing duplicate",
                session.remote_host
            );
            session.close_normal().await;
            return;
        }

        let cipher = SessionCipher::generate();
        let wrapped_key = match self.identity.wrap_for(&peer_public, cipher.key()) {
            Ok(w) => w,
            Err(e) => {
                warn!("session key wrap failed: {}", e);
                session.close(POLICY_CLOSE).await;
                return;
            }
        };
        let wrapped_iv = match self.identity.wrap_for(&peer_public, cipher.iv()) {
            Ok(w) => w,
            Err(e) => {
                warn!("session IV wrap failed: {}", e);
                session.close(POLICY_CLOSE).await;
                return;
            }
        };

        let trusted = TrustedBody {
            key: BASE64.encode(wrapped_key),
            iv: BASE64.encode(wrapped_iv),
            peers: self.table.peer_list(&[signature.clone()]),
            listening: Listening {
                port: self.listen_port(),
                address: self.config.public_address.clone().unwrap_or_default(),
            },
            require_confirmation: self.config.require_confirmation,
        };
        let Ok(body) = serde_json::to_value(&trusted) else {
            session.close(PROTOCOL_CLOSE).await;
            return;
        };

        let mut reply = Envelope::new(FrameType::Trusted, body);
        let body_text = canonical(&reply.body);
        reply.header.signature = Some(BASE64.encode(self.identity.sign(body_text.as_bytes())));

        session.record_trust(peer_public, signature, cipher);
        if session.send_text(reply.to_text()).await.is_ok() {
            info!("trusted peer at {}", session.remote_host);
        }
    }

    /// TRUSTED: unwrap the remote's session material. Arrives only after our
    /// side verified the remote HELO.
    async fn handle_trusted(&self, session: &Arc<Session>, env: Envelope) {
        if !session.is_trusted() {
            warn!("TRUSTED before HELO from {}", session.remote_host);
            session.close(PROTOCOL_CLOSE).await;
            return;
        }
        if session.with_state(|s| s.rx.is_some()) {
            // Duplicate TRUSTED.
            return;
        }
        let Some(peer_public) = session.peer_public() else {
            session.close(PROTOCOL_CLOSE).await;
            return;
        };

        let body_text = canonical(&env.body);
        let Some(sig_b64) = env.header.signature.as_deref() else {
            session.close(PROTOCOL_CLOSE).await;
            return;
        };
        let Ok(sig) = BASE64.decode(sig_b64.trim()) else {
            session.close(PROTOCOL_CLOSE).await;
            return;
        };
        if !verify_with(&peer_public, body_text.as_bytes(), &sig) {
            warn!("TRUSTED signature rejected from {}", session.remote_host);
            session.close(POLICY_CLOSE).await;
            return;
        }

        let Ok(body) = serde_json::from_value::<TrustedBody>(env.body) else {
            session.close(PROTOCOL_CLOSE).await;
            return;
        };
        let material = (|| -> OverlayResult<SessionCipher> {
            let key = BASE64.decode(body.key.trim()).map_err(CryptoError::from)?;
            let iv = BASE64.decode(body.iv.trim()).map_err(CryptoError::from)?;
            let key = self.identity.unwrap(&key)?;
            let iv = self.identity.unwrap(&iv)?;
            Ok(SessionCipher::from_parts(&key, &iv)?)
        })();
        let rx = match material {
            Ok(rx) => rx,
            Err(e) => {
                warn!("session material unwrap failed from {}: {}", session.remote_host, e);
                session.close(POLICY_CLOSE).await;
                return;
            }
        };

        let address = (!body.listening.address.is_empty()).then(|| body.listening.address.clone());
        session.record_remote_material(
            rx,
            body.require_confirmation,
            address,
            Some(body.listening.port),
        );

        let signature = session.ring_signature().unwrap_or_default();
        debug!(
            "session established with peer at {} ({} gossiped peers)",
            session.remote_host,
            body.peers.len()
        );
        let _ = self
            .event_tx
            .send(OverlayEvent::Connection { signature })
            .await;

        self.intake_gossip(&body.peers).await;
    }

    /// Data frames: CONFIRM, PEERS, MESSAGE, and embedder types.
    async fn handle_data(&self, session: &Arc<Session>, env: Envelope) {
        if !session.is_trusted() {
            session.close(PROTOCOL_CLOSE).await;
            return;
        }
        let kind = env.header.kind.clone();
        if let FrameType::Custom(name) = &kind {
            if RESERVED_NAMES.contains(&name.as_str()) {
                debug!("reserved name {:?} used as custom type, dropping", name);
                return;
            }
        }

        let Some(ciphertext) = env.body.as_str() else {
            debug!("data frame without ciphertext body from {}", session.remote_host);
            return;
        };
        // A frame that fails to decrypt or verify is dropped; the link stays up.
        let plaintext = match session.open(ciphertext) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to decrypt frame from {}: {}", session.remote_host, e);
                return;
            }
        };
        let Some(peer_public) = session.peer_public() else {
            return;
        };
        let Some(sig_b64) = env.header.signature.as_deref() else {
            debug!("unsigned data frame from {}", session.remote_host);
            return;
        };
        let Ok(sig) = BASE64.decode(sig_b64.trim()) else {
            return;
        };
        if !verify_with(&peer_public, &plaintext, &sig) {
            warn!("bad body signature from {}", session.remote_host);
            return;
        }
        let body: Value = match serde_json::from_slice(&plaintext) {
            Ok(v) => v,
            Err(e) => {
                debug!("undeserializable body from {}: {}", session.remote_host, e);
                return;
            }
        };
        session.touch();

        if session.peer_requires_confirmation() && kind != FrameType::Confirm {
            let tag = ConfirmTag {
                hash: env.header.hash.clone(),
                timestamp: env.header.timestamp.clone(),
            };
            self.send_confirm(session, tag).await;
        }

        match kind {
            FrameType::Confirm => {
                let Ok(tag) = serde_json::from_value::<ConfirmTag>(body) else {
                    return;
                };
                session.confirm(&tag.hash, &tag.timestamp);
            }
            FrameType::Peers => {
                if let Ok(records) = serde_json::from_value::<Vec<PeerRecord>>(body.clone()) {
                    self.intake_gossip(&records).await;
                }
                self.emit_delivery(session, kind, body, &env.header).await;
            }
            FrameType::Message | FrameType::Custom(_) => {
                self.emit_delivery(session, kind, body, &env.header).await;
            }
            FrameType::Helo | FrameType::Trusted => {}
        }
    }

    async fn emit_delivery(
        &self,
        session: &Arc<Session>,
        kind: FrameType,
        body: Value,
        header: &Header,
    ) {
        let delivery = Delivery {
            kind,
            body,
            from: session.ring_signature().unwrap_or_default(),
            hash: header.hash.clone(),
            timestamp: header.timestamp.clone(),
        };
        let _ = self.event_tx.send(OverlayEvent::Message(delivery)).await;
    }

    async fn send_confirm(&self, session: &Arc<Session>, tag: ConfirmTag) {
        let Ok(body) = serde_json::to_value(&tag) else {
            return;
        };
        self.send_data(session, FrameType::Confirm, &body, Some(tag))
            .await;
    }

    /// Encrypt-then-sign send of one data frame to one session. Appends to
    /// the unconfirmed list and schedules the retry when confirmations are
    /// on; CONFIRM frames bypass that bookkeeping.
    fn send_data<'a>(
        &'a self,
        session: &'a Arc<Session>,
        kind: FrameType,
        body: &'a Value,
        confirm: Option<ConfirmTag>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(self.send_data_inner(session, kind, body, confirm))
    }

    async fn send_data_inner(
        &self,
        session: &Arc<Session>,
        kind: FrameType,
        body: &Value,
        confirm: Option<ConfirmTag>,
    ) {
        if !session.is_trusted() {
            return;
        }
        let plaintext = canonical(body);
        let timestamp = now_timestamp();
        let hash = hash_for(&kind, &plaintext, &timestamp);
        let signature = BASE64.encode(self.identity.sign(plaintext.as_bytes()));
        let Some(ciphertext) = session.seal(plaintext.as_bytes()) else {
            return;
        };

        let env = Envelope {
            header: Header {
                kind: kind.clone(),
                hash: hash.clone(),
                timestamp: timestamp.clone(),
                signature: Some(signature),
                confirm,
            },
            body: Value::String(ciphertext),
        };

        if self.config.require_confirmation && kind != FrameType::Confirm {
            session.push_unconfirmed(PendingSend {
                hash: hash.clone(),
                timestamp: timestamp.clone(),
                kind: kind.clone(),
                body: body.clone(),
            });
            self.schedule_retry(session.clone(), hash, timestamp);
        }

        if let Err(e) = session.send_text(env.to_text()).await {
            // Writer gone; hand the send back to the scheduler instead of
            // recursing, and let it re-resolve the peer by signature.
            debug!("send to {} failed ({}), rescheduling", session.remote_host, e);
            let this = self.clone_handle();
            let target = session.ring_signature();
            let body = body.clone();
            tokio::spawn(async move {
                if let Some(signature) = target {
                    let _ = this.broadcast_to(&signature, kind, body).await;
                }
            });
        }
    }

    /// One retry task per send attempt; re-reads the unconfirmed list at
    /// fire time.
    fn schedule_retry(&self, session: Arc<Session>, hash: String, timestamp: String) {
        let this = self.clone_handle();
        tokio::spawn(async move {
            tokio::time::sleep(this.config.confirm_retry).await;
            if !*this.running.read() {
                return;
            }
            if let Some(pending) = session.take_pending(&hash, &timestamp) {
                // The connection may have left the table since the send.
                if session.is_trusted() && this.table.get(session.id).is_some() {
                    debug!(
                        "no confirmation from {} for {}, rebroadcasting",
                        session.remote_host, pending.hash
                    );
                    this.send_data(&session, pending.kind, &pending.body, None)
                        .await;
                }
            }
        });
    }

    /// Gossip intake: queue unknown peers and kick discovery.
    async fn intake_gossip(&self, records: &[PeerRecord]) {
        let mut added = false;
        for record in records {
            let Ok(signature) = BASE64.decode(record.signature.trim()) else {
                continue;
            };
            if self.identity.is_own_signature(&signature) {
                continue;
            }
            if self.table.is_connected(&signature) {
                continue;
            }
            if self
                .queue
                .push_unique(Candidate::new(record.address.clone(), Some(signature)))
            {
                added = true;
            }
        }
        if added && !self.queue.is_discovering() {
            let this = self.clone_handle();
            tokio::spawn(async move { this.run_discovery().await });
        }
    }

    /// One discovery pass: dial candidates until the queue drains.
    async fn run_discovery(&self) {
        if !self.queue.begin() {
            return;
        }
        let _ = self.event_tx.send(OverlayEvent::Discovering).await;
        debug!("discovery pass started ({} queued)", self.queue.len());

        while let Some(candidate) = self.queue.pop() {
            if !*self.running.read() {
                break;
            }
            if let Some(sig) = &candidate.signature {
                if self.identity.is_own_signature(sig) || self.table.is_connected(sig) {
                    continue;
                }
            }

            let target = candidate.target();
            let port = match target.port {
                Some(port) => port,
                None => {
                    // Expand a port-less candidate instead of dialing it.
                    let (lo, hi) = match self.config.discovery_range {
                        Some(range) => range,
                        None => {
                            let own = self.listen_port();
                            (own, own)
                        }
                    };
                    for port in lo..=hi {
                        let address = match &target.scheme {
                            Some(scheme) => format!("{}://{}:{}", scheme, target.host, port),
                            None => format!("{}:{}", target.host, port),
                        };
                        self.queue
                            .push_unique(Candidate::new(address, candidate.signature.clone()));
                    }
                    continue;
                }
            };

            let url = target.url(&self.config.default_scheme, port);
            match dial(&url).await {
                Ok(ws) => {
                    self.clone_handle()
                        .spawn_connection(ws, target.host.clone(), true);
                }
                Err(e) => {
                    debug!("dial {} failed: {}", url, e);
                }
            }
        }

        self.queue.end();
        let _ = self.event_tx.send(OverlayEvent::Discovered).await;
        debug!("discovery pass finished");
    }

    /// Connection teardown: abnormal closes re-enter discovery after the
    /// backoff delay.
    async fn handle_close(&self, session: &Arc<Session>, code: u16) {
        let in_table = self.table.remove(session.id).is_some();
        let was_trusted = session.phase() == Phase::Trusted;
        debug!(
            "connection to {} closed (code {})",
            session.remote_host, code
        );

        if !in_table || !was_trusted || code == NORMAL_CLOSE || !*self.running.read() {
            return;
        }
        let Some(signature) = session.ring_signature() else {
            return;
        };

        let (address, port) = session.with_state(|s| (s.reported_address.clone(), s.reported_port));
        let host = address.unwrap_or_else(|| session.remote_host.clone());
        let address = match port {
            Some(port) if !host.contains(':') => format!("{}:{}", host, port),
            _ => host,
        };
        self.queue.push_unique(Candidate::new(address, Some(signature)));
        info!(
            "peer at {} lost abnormally, reconnect queued",
            session.remote_host
        );

        let this = self.clone_handle();
        tokio::spawn(async move {
            tokio::time::sleep(this.config.reconnect_delay).await;
            if *this.running.read() && !this.queue.is_discovering() && !this.queue.is_empty() {
                this.run_discovery().await;
            }
        });
    }
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("port", &self.listen_port())
            .field("running", &self.is_running())
            .field("peers", &self.peer_count())
            .finish()
    }
}
