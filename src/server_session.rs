//! C8: `ServerSession` / session registry / per-connection control handler
//! (§3, §4.2, §4.3 step 3). Grounded on `server.rs::control_loop`/
//! `per_client_control`/`ServerState` — an accept loop handing each
//! connection off to a per-connection handler, a `DashMap` of live
//! per-connection state, heartbeat-driven eviction — generalized from one
//! flat `DashMap<SocketAddr, ClientInfo>` to the two-level session →
//! receiver-record structure §3's ownership rule requires (a receiver
//! record is owned exclusively by the session it joined).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::block::derive_block_size;
use crate::config::ServerConfig;
use crate::control::ControlChannel;
use crate::crypto::{self, BlockCipher, PskKey};
use crate::error::{Result, TransferError};
use crate::fileset::FileSet;
use crate::scheduler::{ChunkSender, ReceiverId, WaveScheduler};
use crate::session::{FileHeader, Session};
use crate::wire::{Message, PacketResponseType, Status};

/// Builds the `ChunkSender` (and anything else session-local the
/// multicast data plane needs) once a session's `FileHeader`/`FileChunk`
/// list is known. Kept as a trait so `server_session.rs` stays ignorant
/// of the concrete `DatagramGroup`/`FileSet` pairing (production wires
/// `UdpDatagramGroup` + `FsFileSet` via `sender::MulticastSender`; tests
/// supply an in-process double).
#[async_trait::async_trait]
pub trait SessionSenderFactory: Send + Sync {
    async fn build(&self, session: &Session, cipher: Option<BlockCipher>) -> Result<Arc<dyn ChunkSender>>;
}

/// One admitted payload transfer (§3 "Session"). Bundles the negotiated
/// `Session` metadata with the `WaveScheduler` driving its data plane and
/// the bookkeeping needed to admit/evict receivers and tear the session
/// down once idle.
pub struct ServerSession {
    pub session: Session,
    pub scheduler: WaveScheduler,
    max_connections: usize,
    /// Set once the wave-driving task has been spawned, so a second
    /// admitted receiver doesn't start a duplicate loop.
    wave_task_started: Mutex<bool>,
    /// `None` while the session has at least one admitted receiver;
    /// `Some(since)` records when the admitted set last became empty, for
    /// the idle-grace teardown check (§3 "Session" lifecycle).
    idle_since: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl ServerSession {
    fn new(session: Session, max_connections: usize) -> Self {
        let total_chunks = session.total_chunks();
        Self {
            session,
            scheduler: WaveScheduler::new(0, total_chunks),
            max_connections,
            wave_task_started: Mutex::new(false),
            idle_since: Mutex::new(Some(Instant::now())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn admitted_count(&self) -> usize {
        self.scheduler.receiver_count()
    }

    fn can_admit(&self) -> bool {
        self.admitted_count() < self.max_connections
    }

    fn mark_admission(&self, id: ReceiverId) {
        self.scheduler.admit_receiver(id);
        *self.idle_since.lock() = None;
    }

    fn mark_departure(&self, id: ReceiverId) {
        self.scheduler.remove_receiver(id);
        if self.admitted_count() == 0 {
            *self.idle_since.lock() = Some(Instant::now());
        }
    }

    /// True once (a) the aggregate is all-ones, (b) the admitted set is
    /// empty and `idle_grace` has elapsed, or (c) every admitted receiver
    /// has signalled `leaving_session=true` — the latter is observed
    /// indirectly since `evict_stale` already removes them (§4.3
    /// "Termination").
    fn should_tear_down(&self, idle_grace: Duration) -> bool {
        if self.scheduler.is_complete() {
            return true;
        }
        if let Some(since) = *self.idle_since.lock() {
            return since.elapsed() >= idle_grace;
        }
        false
    }

    fn cancel_wave_loop(&self) {
        self.cancel.cancel();
    }
}

/// Registry of live sessions, one per distinct payload `path` (§3, §4.2
/// step 6 admission limits). Grounded on `ServerState.clients` in spirit:
/// a single `DashMap` the accept/control loop shares across connections,
/// here keyed by `path` instead of `SocketAddr` and holding a session
/// rather than a flat client record.
pub struct SessionRegistry<F, SF> {
    config: ServerConfig,
    file_set: Arc<F>,
    sender_factory: Arc<SF>,
    sessions: DashMap<String, Arc<ServerSession>>,
    /// Free-list of `session_id` slots in `[0, MaxSessions)` (§3
    /// "Session": `session_id ∈ [0, MaxSessions)`). Reclaimed on
    /// teardown so long-lived servers don't run out of slots.
    free_session_ids: Mutex<Vec<u32>>,
    next_receiver_id: AtomicU32,
}

impl<F, SF> SessionRegistry<F, SF>
where
    F: FileSet + 'static,
    SF: SessionSenderFactory + 'static,
{
    pub fn new(config: ServerConfig, file_set: Arc<F>, sender_factory: Arc<SF>) -> Self {
        let free_session_ids = (0..config.max_sessions as u32).rev().collect();
        Self {
            config,
            file_set,
            sender_factory,
            sessions: DashMap::new(),
            free_session_ids: Mutex::new(free_session_ids),
            next_receiver_id: AtomicU32::new(0),
        }
    }

    pub fn live_session_count(&self) -> usize {
        self.sessions.len()
    }

    fn next_receiver_id(&self) -> ReceiverId {
        self.next_receiver_id.fetch_add(1, Ordering::Relaxed) as ReceiverId
    }

    /// Admit to (or create) the session for `path` (§4.2 step 6). Returns
    /// `Refused` if the session doesn't exist yet and `MaxSessions` is
    /// already reached, or if it exists but is full.
    async fn admit(self: &Arc<Self>, path: &str, psk_key: Option<&PskKey>) -> Result<Arc<ServerSession>> {
        if let Some(existing) = self.sessions.get(path) {
            if !existing.can_admit() {
                return Err(TransferError::Refused(format!(
                    "session '{path}' is at MaxConnectionsPerSession"
                )));
            }
            return Ok(existing.clone());
        }

        let session_id = match self.free_session_ids.lock().pop() {
            Some(id) => id,
            None => return Err(TransferError::Refused("MaxSessions reached".into())),
        };

        // From here on, any early return must give the slot back.
        match self.admit_new_session(path, psk_key, session_id).await {
            Ok(server_session) => Ok(server_session),
            Err(e) => {
                self.free_session_ids.lock().push(session_id);
                Err(e)
            }
        }
    }

    async fn admit_new_session(self: &Arc<Self>, path: &str, psk_key: Option<&PskKey>, session_id: u32) -> Result<Arc<ServerSession>> {
        let files = self.file_set.headers(path).await?;
        let cipher = psk_key.cloned().map(BlockCipher::new);
        let block_size = derive_block_size(
            self.config.mtu,
            self.config.ipv6,
            cipher.as_ref().map(|c| c as &dyn crate::block::PayloadEncoder),
        )?;

        let session = Session::new(
            session_id,
            self.config.multicast_address,
            self.config.multicast_start_port,
            self.config.root_folder.join(path),
            files,
            block_size,
        );

        let server_session = Arc::new(ServerSession::new(session, self.config.max_connections_per_session));
        self.sessions.insert(path.to_string(), server_session.clone());
        info!(session_id, path, "created session");
        Ok(server_session)
    }

    /// Spawn the session's wave-driving loop exactly once, the first time
    /// a receiver is admitted.
    async fn ensure_wave_task(self: &Arc<Self>, path: String, server_session: Arc<ServerSession>, psk_key: Option<PskKey>) -> Result<()> {
        let mut started = server_session.wave_task_started.lock();
        if *started {
            return Ok(());
        }
        *started = true;
        drop(started);

        let cipher = psk_key.map(BlockCipher::new);
        let sender = self.sender_factory.build(&server_session.session, cipher).await?;
        let registry = self.clone();
        let burst_length = self.config.multicast_burst_length;
        let boundary_timeout = self.config.wave_boundary_timeout();

        tokio::spawn(async move {
            let result = server_session
                .scheduler
                .run(sender.as_ref(), &server_session.cancel, burst_length, boundary_timeout)
                .await;
            if let Err(e) = result {
                warn!(error = %e, "wave scheduler exited with error");
            }
            // The loop above returns as soon as the admitted set drops to
            // zero (see `WaveScheduler::run`), which can happen well before
            // `idle_grace` tears the session down. Re-arm the latch so a
            // receiver admitted into this still-live session gets a fresh
            // wave task rather than silently never being served.
            *server_session.wave_task_started.lock() = false;
            registry.maybe_teardown(&path).await;
        });
        Ok(())
    }

    async fn maybe_teardown(self: &Arc<Self>, path: &str) {
        let should_remove = match self.sessions.get(path) {
            Some(s) => s.should_tear_down(self.config.idle_grace),
            None => false,
        };
        if should_remove {
            if let Some((_, session)) = self.sessions.remove(path) {
                session.cancel_wave_loop();
                self.free_session_ids.lock().push(session.session.session_id);
                info!(session_id = session.session.session_id, path, "session torn down");
            }
        }
    }

    fn psk_key(&self) -> Option<PskKey> {
        self.config
            .pass_phrase
            .as_deref()
            .map(|p| PskKey::derive(p, crate::config::PassphraseEncoding::Utf16Le))
    }

    /// Full per-connection lifecycle (§4.2 steps 1–8, then the
    /// status-update loop of §4.3 step 3/4.4). Returns once the control
    /// channel closes or a fatal error occurs.
    pub async fn serve_connection(self: &Arc<Self>, mut channel: Box<dyn ControlChannel>) -> Result<()> {
        let psk_key = self.psk_key();

        // Step 2: Challenge.
        let (challenge_value, wire_challenge) = crypto::build_challenge(psk_key.as_ref());
        channel.send(&Message::Challenge { challenge_key: wire_challenge }).await?;

        // Step 4/5: ChallengeResponse.
        let response = channel.recv().await?;
        let response_key = match response {
            Message::ChallengeResponse { challenge_key } => challenge_key,
            other => return Err(TransferError::MalformedFrame(format!("expected ChallengeResponse, got {other:?}"))),
        };
        if !crypto::verify_challenge_response(psk_key.as_ref(), &challenge_value, &response_key) {
            channel
                .send(&Message::Response {
                    status: Status::AuthFailed,
                    error_message: Some("PSK challenge verification failed".into()),
                })
                .await?;
            return Err(TransferError::AuthFailed("challenge response mismatch".into()));
        }

        // Step 6: SessionJoinRequest.
        let join_request = channel.recv().await?;
        let (path, _state) = match join_request {
            Message::SessionJoinRequest { path, state } => (path, state),
            other => return Err(TransferError::MalformedFrame(format!("expected SessionJoinRequest, got {other:?}"))),
        };

        let server_session = match self.admit(&path, psk_key.as_ref()).await {
            Ok(s) => s,
            Err(TransferError::Refused(msg)) => {
                channel
                    .send(&Message::SessionJoinResponse {
                        status: Status::Refused,
                        error_message: Some(msg.clone()),
                        files: Vec::new(),
                        multicast_address: Ipv4Addr::UNSPECIFIED.into(),
                        multicast_port: 0,
                        wave_number: 0,
                        block_size: 0,
                    })
                    .await?;
                return Err(TransferError::Refused(msg));
            }
            Err(e) => return Err(e),
        };

        // Step 7: SessionJoinResponse.
        channel
            .send(&Message::SessionJoinResponse {
                status: Status::Ok,
                error_message: None,
                files: server_session.session.files.clone(),
                multicast_address: server_session.session.multicast_address.into(),
                multicast_port: server_session.session.multicast_port,
                wave_number: server_session.scheduler.current_wave(),
                block_size: server_session.session.block_size,
            })
            .await?;

        // Step 8: admit into the scheduler's aggregate and ensure the
        // session's wave loop is running.
        let receiver_id = self.next_receiver_id();
        server_session.mark_admission(receiver_id);
        self.ensure_wave_task(path.clone(), server_session.clone(), psk_key.clone()).await?;

        let result = self.status_update_loop(&mut channel, &server_session, receiver_id).await;

        server_session.mark_departure(receiver_id);
        self.maybe_teardown(&path).await;
        result
    }

    /// §4.3 step 3/4: answer `PacketStatusUpdate`s with the current
    /// reception rate (or `WaveComplete` once the current wave's plan is
    /// exhausted), and `WaveStatusUpdate`s with the refreshed
    /// `WaveCompleteResponse`. Runs until the channel closes, the
    /// receiver signals `leaving_session=true`, or it is evicted.
    async fn status_update_loop(
        &self,
        channel: &mut Box<dyn ControlChannel>,
        server_session: &Arc<ServerSession>,
        receiver_id: ReceiverId,
    ) -> Result<()> {
        loop {
            let msg = tokio::time::timeout(self.config.read_timeout, channel.recv())
                .await
                .map_err(|_| TransferError::TransportLost(std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout")))??;

            match msg {
                Message::PacketStatusUpdate { bytes_left, leaving_session } => {
                    server_session.scheduler.touch(receiver_id);
                    if leaving_session {
                        return Ok(());
                    }
                    let plan_exhausted = server_session.scheduler.plan_exhausted();
                    let response_type = if plan_exhausted {
                        PacketResponseType::WaveComplete
                    } else {
                        PacketResponseType::Ok
                    };
                    let reception_rate = server_session.scheduler.wave_reception_rate(receiver_id).unwrap_or(0.0);
                    let _ = bytes_left;
                    channel
                        .send(&Message::PacketStatusUpdateResponse {
                            status: Status::Ok,
                            error_message: None,
                            reception_rate,
                            response_type,
                        })
                        .await?;
                }
                Message::WaveStatusUpdate {
                    bytes_left: _,
                    leaving_session,
                    file_bit_vector,
                } => {
                    let reported = crate::bitvector::BitVector::from_raw_bytes(&file_bit_vector, server_session.session.total_chunks())?;
                    server_session.scheduler.report_bits(receiver_id, &reported, leaving_session);
                    if leaving_session {
                        channel
                            .send(&Message::WaveCompleteResponse {
                                status: Status::Ok,
                                error_message: None,
                                wave_number: server_session.scheduler.current_wave(),
                            })
                            .await?;
                        return Ok(());
                    }
                    channel
                        .send(&Message::WaveCompleteResponse {
                            status: Status::Ok,
                            error_message: None,
                            wave_number: server_session.scheduler.current_wave(),
                        })
                        .await?;
                    if server_session.scheduler.is_complete() {
                        return Ok(());
                    }
                }
                other => {
                    return Err(TransferError::MalformedFrame(format!(
                        "unexpected message in status loop: {other:?}"
                    )))
                }
            }
        }
    }
}
