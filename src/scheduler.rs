//! C9: the server-side wave scheduler (§4.3). Tracks one aggregate
//! bit-vector per session across all admitted receivers, computes each
//! wave's ascending transmit plan, and evicts receivers silent past the
//! wave-boundary timeout. Grounded on the retrieved TFTP multicast
//! module's `MulticastSession` (`HashMap<SocketAddr, ClientState>` with
//! per-client ack tracking, a `retransmit_queue`, and inactive-client
//! eviction by `last_seen`), generalized from a per-block ack *set* to
//! this protocol's AND-aggregated bit *vector*, and from TFTP's
//! unicast retransmit-on-timeout to bounded, burst-paced multicast waves.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bitvector::BitVector;
use crate::error::Result;

pub type ReceiverId = u64;

struct ReceiverState {
    bits: BitVector,
    last_report: Instant,
    leaving: bool,
    /// Set once this receiver has delivered the full-bit-vector
    /// `WaveStatusUpdate` for the wave currently in flight (§4.3 step 4:
    /// "after all admitted receivers have delivered a WaveStatusUpdate").
    /// Cleared each time [`WaveScheduler::run`] starts a new wave's burst.
    reported_current_wave: bool,
}

/// §9 "boxed scalars and volatile progress fields": a single-writer,
/// multi-reader progress counter updated by the scheduler and sampled by
/// observers (e.g. a status endpoint), backed by an atomic word instead of
/// a lock.
pub struct ProgressCell(AtomicU64);

impl ProgressCell {
    pub fn new(v: u64) -> Self {
        Self(AtomicU64::new(v))
    }

    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn store(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }
}

/// Sends one planned chunk (§2 C10). Implemented by `sender::MulticastSender`;
/// kept as a narrow trait here so the scheduler's wave loop doesn't need
/// to know about `FileSet`/`BlockCipher`/`DatagramGroup` directly.
#[async_trait::async_trait]
pub trait ChunkSender: Send + Sync {
    async fn send(&self, segment_id: u64) -> Result<()>;
}

/// One session's wave state (§3, §4.3).
pub struct WaveScheduler {
    session_id: u32,
    total_chunks: usize,
    receivers: DashMap<ReceiverId, ReceiverState>,
    wave: AtomicU64,
    /// Segments emitted so far within the wave currently in flight; reset
    /// to zero each time a new `plan` is built (§4.3 reception-rate
    /// computation).
    transmitted_in_wave: AtomicU64,
    /// True once [`Self::run`]'s burst loop has emitted every `segment_id`
    /// in the current wave's plan (§4.3 step 3, Glossary "Wave-complete":
    /// the plan is exhausted, not the aggregate). This is the signal
    /// `status_update_loop` (`server_session.rs`) answers
    /// `PacketStatusUpdate`s against — it must NOT be derived from
    /// `transmit_plan().is_empty()`, which recomputes the *aggregate* and
    /// so can only ever be true once every receiver has already finished,
    /// making the "please send your bit vector" handshake unreachable.
    plan_exhausted: AtomicBool,
}

impl WaveScheduler {
    pub fn new(session_id: u32, total_chunks: usize) -> Self {
        Self {
            session_id,
            total_chunks,
            receivers: DashMap::new(),
            wave: AtomicU64::new(0),
            transmitted_in_wave: AtomicU64::new(0),
            plan_exhausted: AtomicBool::new(false),
        }
    }

    /// True once the current wave's plan has been fully transmitted (§4.3
    /// step 3). Read by `status_update_loop` to decide whether a
    /// `PacketStatusUpdate` gets an `Ok` or a `WaveComplete` response.
    pub fn plan_exhausted(&self) -> bool {
        self.plan_exhausted.load(Ordering::Relaxed)
    }

    pub fn current_wave(&self) -> u64 {
        self.wave.load(Ordering::Relaxed)
    }

    /// Admit a receiver with an all-unset bit vector (§4.2 step 6).
    pub fn admit_receiver(&self, id: ReceiverId) {
        self.receivers.insert(
            id,
            ReceiverState {
                bits: BitVector::new(self.total_chunks),
                last_report: Instant::now(),
                leaving: false,
                reported_current_wave: false,
            },
        );
        info!(session_id = self.session_id, receiver = id, "admitted receiver");
    }

    pub fn remove_receiver(&self, id: ReceiverId) {
        self.receivers.remove(&id);
        debug!(session_id = self.session_id, receiver = id, "removed receiver");
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    /// Merge a receiver-reported bit vector (§4.4 `WaveStatusUpdate`/
    /// `PacketStatusUpdate`). Bits are monotonic, so this is a bitwise OR
    /// against the stored vector, never a replace.
    pub fn report_bits(&self, id: ReceiverId, reported: &BitVector, leaving: bool) {
        if let Some(mut state) = self.receivers.get_mut(&id) {
            for i in 0..self.total_chunks {
                if reported.test(i) {
                    state.bits.set(i);
                }
            }
            state.last_report = Instant::now();
            state.leaving = leaving;
            state.reported_current_wave = true;
        }
    }

    /// True once every currently admitted receiver has delivered a
    /// `WaveStatusUpdate` for the wave in flight (§4.3 step 4). Vacuously
    /// true with no admitted receivers — callers already special-case that
    /// (`run`'s `receiver_count() == 0` check ends the session outright).
    pub fn all_reported(&self) -> bool {
        self.receivers.iter().all(|r| r.reported_current_wave)
    }

    /// Mark a single segment received for one receiver (a lighter-weight
    /// path than re-sending the whole bit vector every datagram; used
    /// when a receiver's `PacketStatusUpdate` only needs to bump
    /// `bytes_left`/liveness and the bit itself was already inferred from
    /// having successfully decoded the `FileSegment`).
    pub fn mark_segment(&self, id: ReceiverId, segment_id: u64) {
        if let Some(mut state) = self.receivers.get_mut(&id) {
            if (segment_id as usize) < self.total_chunks {
                state.bits.set(segment_id as usize);
            }
            state.last_report = Instant::now();
        }
    }

    pub fn touch(&self, id: ReceiverId) {
        if let Some(mut state) = self.receivers.get_mut(&id) {
            state.last_report = Instant::now();
        }
    }

    pub fn reception_rate(&self, id: ReceiverId) -> Option<f32> {
        let state = self.receivers.get(&id)?;
        if self.total_chunks == 0 {
            return Some(1.0);
        }
        let received = (0..self.total_chunks).filter(|&i| state.bits.test(i)).count();
        Some(received as f32 / self.total_chunks as f32)
    }

    /// §4.3 "Reception-rate computation":
    /// `transmitted_in_current_wave / (transmitted_in_current_wave +
    /// still_missing_for_this_receiver)`, clamped to `[0,1]`. This is the
    /// value carried in `PacketStatusUpdateResponse.reception_rate`, an
    /// observability signal distinct from [`Self::reception_rate`] (which
    /// reports the receiver's overall fraction of confirmed chunks).
    pub fn wave_reception_rate(&self, id: ReceiverId) -> Option<f32> {
        let state = self.receivers.get(&id)?;
        let missing = (0..self.total_chunks).filter(|&i| !state.bits.test(i)).count() as f32;
        let transmitted = self.transmitted_in_wave.load(Ordering::Relaxed) as f32;
        let denom = transmitted + missing;
        if denom <= 0.0 {
            return Some(1.0);
        }
        Some((transmitted / denom).clamp(0.0, 1.0))
    }

    /// Bitwise AND across every admitted receiver's bit vector (§4.3
    /// "aggregate"): bit `i` set iff every receiver has confirmed chunk
    /// `i`.
    pub fn aggregate(&self) -> BitVector {
        let snapshot: Vec<BitVector> = self.receivers.iter().map(|r| r.bits.clone()).collect();
        BitVector::aggregate_and(self.total_chunks, &snapshot)
    }

    /// Ascending-order segment IDs still unconfirmed by at least one
    /// admitted receiver (§4.3, §9 "strictly ascending" resolution).
    pub fn transmit_plan(&self) -> Vec<u64> {
        self.aggregate().unset_indices().map(|i| i as u64).collect()
    }

    /// True once the aggregate bit vector is all-set, i.e. every admitted
    /// receiver has confirmed every chunk (§4.3 termination condition).
    pub fn is_complete(&self) -> bool {
        self.aggregate().all_set()
    }

    /// Evict receivers that haven't reported since before `boundary_timeout`
    /// ago, or that flagged `leaving_session`. Returns the evicted IDs.
    pub fn evict_stale(&self, boundary_timeout: Duration) -> Vec<ReceiverId> {
        let now = Instant::now();
        let stale: Vec<ReceiverId> = self
            .receivers
            .iter()
            .filter(|r| r.leaving || now.duration_since(r.last_report) > boundary_timeout)
            .map(|r| *r.key())
            .collect();
        for id in &stale {
            self.receivers.remove(id);
            warn!(session_id = self.session_id, receiver = id, "evicted stale receiver");
        }
        stale
    }

    pub fn advance_wave(&self) -> u64 {
        self.wave.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drive waves until every admitted receiver confirms every chunk, the
    /// session has no admitted receivers left, or `cancel` fires (§4.3
    /// step 2: burst-then-yield pacing; boundary timeout governs how long
    /// a wave waits for stragglers before the next one begins).
    pub async fn run(
        &self,
        sender: &dyn ChunkSender,
        cancel: &CancellationToken,
        burst_length: usize,
        boundary_timeout: Duration,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if self.receiver_count() == 0 || self.is_complete() {
                return Ok(());
            }

            let plan = self.transmit_plan();
            self.transmitted_in_wave.store(0, Ordering::Relaxed);
            self.plan_exhausted.store(false, Ordering::Relaxed);
            for mut r in self.receivers.iter_mut() {
                r.reported_current_wave = false;
            }
            info!(
                session_id = self.session_id,
                wave = self.current_wave(),
                pending = plan.len(),
                "starting wave"
            );

            for burst in plan.chunks(burst_length.max(1)) {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                for &segment_id in burst {
                    sender.send(segment_id).await?;
                    self.transmitted_in_wave.fetch_add(1, Ordering::Relaxed);
                }
                tokio::task::yield_now().await;
            }

            // §4.3 step 3: the plan is exhausted — subsequent
            // `PacketStatusUpdate`s get `WaveComplete` so receivers send a
            // full `WaveStatusUpdate` back.
            self.plan_exhausted.store(true, Ordering::Relaxed);

            let wave_start = Instant::now();
            while wave_start.elapsed() < boundary_timeout {
                // §4.3 step 4: advance as soon as every admitted receiver
                // has acked this wave, instead of always waiting out the
                // full boundary timeout.
                if cancel.is_cancelled() || self.is_complete() || self.receiver_count() == 0 || self.all_reported() {
                    break;
                }
                sleep(Duration::from_millis(50)).await;
            }

            self.evict_stale(boundary_timeout);
            self.advance_wave();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSender {
        sent: parking_lot::Mutex<Vec<u64>>,
    }

    #[async_trait::async_trait]
    impl ChunkSender for CountingSender {
        async fn send(&self, segment_id: u64) -> Result<()> {
            self.sent.lock().push(segment_id);
            Ok(())
        }
    }

    #[test]
    fn aggregate_requires_all_admitted_receivers() {
        let sched = WaveScheduler::new(1, 4);
        sched.admit_receiver(1);
        sched.admit_receiver(2);

        let mut partial = BitVector::new(4);
        partial.set(0);
        partial.set(1);
        sched.report_bits(1, &partial, false);

        let mut other = BitVector::new(4);
        other.set(0);
        sched.report_bits(2, &other, false);

        let agg = sched.aggregate();
        assert!(agg.test(0));
        assert!(!agg.test(1));
        assert_eq!(sched.transmit_plan(), vec![1, 2, 3]);
    }

    #[test]
    fn mark_segment_sets_single_bit() {
        let sched = WaveScheduler::new(1, 4);
        sched.admit_receiver(1);
        sched.mark_segment(1, 2);
        assert_eq!(sched.reception_rate(1), Some(0.25));
    }

    #[test]
    fn evict_stale_removes_receivers_past_boundary() {
        let sched = WaveScheduler::new(1, 4);
        sched.admit_receiver(1);
        std::thread::sleep(Duration::from_millis(20));
        let evicted = sched.evict_stale(Duration::from_millis(5));
        assert_eq!(evicted, vec![1]);
        assert_eq!(sched.receiver_count(), 0);
    }

    #[test]
    fn evict_stale_removes_receivers_that_flagged_leaving() {
        let sched = WaveScheduler::new(1, 4);
        sched.admit_receiver(1);
        let mut bits = BitVector::new(4);
        bits.set(0);
        sched.report_bits(1, &bits, true);
        let evicted = sched.evict_stale(Duration::from_secs(60));
        assert_eq!(evicted, vec![1]);
    }

    #[test]
    fn wave_reception_rate_before_any_transmission_reflects_missing_only() {
        let sched = WaveScheduler::new(1, 4);
        sched.admit_receiver(1);
        let mut bits = BitVector::new(4);
        bits.set(0);
        sched.report_bits(1, &bits, false);
        // transmitted_in_wave is still 0 (no `run()` call yet), so the
        // rate is 0 until this wave's sends start landing.
        assert_eq!(sched.wave_reception_rate(1), Some(0.0));
    }

    #[test]
    fn wave_reception_rate_all_confirmed_is_one() {
        let sched = WaveScheduler::new(1, 2);
        sched.admit_receiver(1);
        let mut full = BitVector::new(2);
        full.set(0);
        full.set(1);
        sched.report_bits(1, &full, false);
        assert_eq!(sched.wave_reception_rate(1), Some(1.0));
    }

    #[test]
    fn is_complete_true_when_all_receivers_confirm_everything() {
        let sched = WaveScheduler::new(1, 2);
        sched.admit_receiver(1);
        let mut full = BitVector::new(2);
        full.set(0);
        full.set(1);
        sched.report_bits(1, &full, false);
        assert!(sched.is_complete());
    }

    #[tokio::test]
    async fn run_sends_every_planned_segment_and_stops_once_complete() {
        let sched = std::sync::Arc::new(WaveScheduler::new(1, 3));
        sched.admit_receiver(1);

        let sender = CountingSender { sent: parking_lot::Mutex::new(Vec::new()) };
        let cancel = CancellationToken::new();

        // Simulate the receiver immediately confirming everything after
        // the first wave's burst, so `run` exits after one iteration.
        let sched_clone = sched.clone();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            let mut full = BitVector::new(3);
            full.set(0);
            full.set(1);
            full.set(2);
            sched_clone.report_bits(1, &full, false);
            cancel_clone.cancel();
        });

        sched
            .run(&sender, &cancel, 64, Duration::from_millis(500))
            .await
            .unwrap();

        assert_eq!(*sender.sent.lock(), vec![0, 1, 2]);
    }

    /// Regression test for the circular "wave complete" signal: this must
    /// flip true as soon as the burst loop finishes, not only once the
    /// aggregate (which needs a `WaveStatusUpdate` to move at all) happens
    /// to already be all-set.
    #[tokio::test]
    async fn plan_exhausted_and_all_reported_track_the_current_wave() {
        let sched = std::sync::Arc::new(WaveScheduler::new(1, 2));
        sched.admit_receiver(1);

        let sender = CountingSender { sent: parking_lot::Mutex::new(Vec::new()) };
        let cancel = CancellationToken::new();

        let sched_clone = sched.clone();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            loop {
                if sched_clone.plan_exhausted() {
                    break;
                }
                sleep(Duration::from_millis(5)).await;
            }
            // The burst already landed but nobody has acked yet: the
            // handshake must be reachable here, well before the aggregate
            // could possibly be all-set.
            assert!(!sched_clone.all_reported());
            assert!(!sched_clone.is_complete());

            let mut full = BitVector::new(2);
            full.set(0);
            full.set(1);
            sched_clone.report_bits(1, &full, false);
            assert!(sched_clone.all_reported());
            cancel_clone.cancel();
        });

        sched
            .run(&sender, &cancel, 64, Duration::from_secs(5))
            .await
            .unwrap();
    }
}
