//! RFC 3261 §17 timers, driven by a single hashed timing wheel rather
//! than a thread per timer. Each tick drains its slot's due entries into
//! the manager's worker pool; cancelling a timer tombstones its entry
//! instead of removing it from the slot, avoiding an O(n) search.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::key::TransactionKey;

/// Default RFC 3261 §17.1.1.1 timer base values.
#[derive(Debug, Clone, Copy)]
pub struct TimerSettings {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        TimerSettings { t1: Duration::from_millis(500), t2: Duration::from_millis(4000), t4: Duration::from_millis(5000) }
    }
}

impl TimerSettings {
    pub fn timer_b(&self) -> Duration {
        self.t1 * 64
    }

    pub fn timer_h(&self) -> Duration {
        self.t1 * 64
    }

    pub fn timer_j(&self) -> Duration {
        self.t1 * 64
    }

    pub fn timer_d(&self) -> Duration {
        std::cmp::max(self.t1 * 64, Duration::from_secs(32))
    }
}

/// Which RFC 3261 timer fired. Retransmission timers (A, E, G) only ever
/// apply to unreliable transports; the manager skips scheduling them on
/// TCP/TLS/WS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// INVITE client request retransmit.
    A,
    /// INVITE client transaction timeout.
    B,
    /// INVITE client wait for response retransmits after Completed.
    D,
    /// Non-INVITE client request retransmit.
    E,
    /// Non-INVITE client transaction timeout.
    F,
    /// INVITE server response retransmit.
    G,
    /// INVITE server wait for ACK.
    H,
    /// INVITE server wait for ACK retransmits after Confirmed.
    I,
    /// Non-INVITE server wait for request retransmits after Completed.
    J,
    /// Non-INVITE client wait for response retransmits after Completed.
    K,
}

impl TimerKind {
    pub fn name(&self) -> &'static str {
        match self {
            TimerKind::A => "A",
            TimerKind::B => "B",
            TimerKind::D => "D",
            TimerKind::E => "E",
            TimerKind::F => "F",
            TimerKind::G => "G",
            TimerKind::H => "H",
            TimerKind::I => "I",
            TimerKind::J => "J",
            TimerKind::K => "K",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimerFired {
    pub key: TransactionKey,
    pub kind: TimerKind,
    /// A monotonically increasing generation stamped when the timer was
    /// armed; the receiver discards events whose generation doesn't
    /// match the timer's current generation (i.e. it was cancelled and
    /// possibly re-armed since).
    pub generation: u64,
}

struct Entry {
    fire_at_tick: u64,
    fired: TimerFired,
}

const TICK: Duration = Duration::from_millis(50);
const WHEEL_SLOTS: usize = 2048;

/// A single background task ticking every [`TICK`], draining due entries
/// from one hashed-wheel slot per tick into an mpsc channel the
/// transaction manager consumes.
pub struct TimerWheel {
    slots: Vec<DashMap<(TransactionKey, TimerKind), Entry>>,
    tick: AtomicU64,
    generations: DashMap<(TransactionKey, TimerKind), u64>,
    fired_tx: mpsc::Sender<TimerFired>,
}

impl TimerWheel {
    pub fn spawn() -> (Arc<Self>, mpsc::Receiver<TimerFired>) {
        let (fired_tx, fired_rx) = mpsc::channel(1024);
        let wheel = Arc::new(TimerWheel {
            slots: (0..WHEEL_SLOTS).map(|_| DashMap::new()).collect(),
            tick: AtomicU64::new(0),
            generations: DashMap::new(),
            fired_tx,
        });

        let driver = wheel.clone();
        tokio::spawn(async move {
            let mut ticker = interval(TICK);
            loop {
                ticker.tick().await;
                driver.advance().await;
            }
        });

        (wheel, fired_rx)
    }

    async fn advance(&self) {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = &self.slots[(tick as usize) % WHEEL_SLOTS];
        let due: Vec<_> = slot
            .iter()
            .filter(|e| e.fire_at_tick <= tick)
            .map(|e| (e.key().clone(), e.fired.clone()))
            .collect();
        for (key, fired) in due {
            slot.remove(&key);
            let current_generation = self.generations.get(&key).map(|g| *g).unwrap_or(0);
            if fired.generation == current_generation {
                let _ = self.fired_tx.send(fired).await;
            }
        }
    }

    /// Arms `kind` for `key` to fire after `delay`, replacing any
    /// existing timer of the same kind for that transaction (its
    /// generation bump tombstones the old slot entry).
    pub fn arm(&self, key: TransactionKey, kind: TimerKind, delay: Duration) {
        let slot_key = (key.clone(), kind);
        let generation = {
            let mut entry = self.generations.entry(slot_key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let ticks = (delay.as_millis() / TICK.as_millis()).max(1) as u64;
        let fire_at_tick = self.tick.load(Ordering::Relaxed) + ticks;
        let slot = &self.slots[(fire_at_tick as usize) % WHEEL_SLOTS];
        slot.insert(slot_key, Entry { fire_at_tick, fired: TimerFired { key, kind, generation } });
    }

    /// Tombstones any pending timer of `kind` for `key` without removing
    /// its slot entry; the next tick's generation check discards it.
    pub fn cancel(&self, key: &TransactionKey, kind: TimerKind) {
        if let Some(mut entry) = self.generations.get_mut(&(key.clone(), kind)) {
            *entry += 1;
        }
    }

    pub fn cancel_all(&self, key: &TransactionKey) {
        for kind in [
            TimerKind::A,
            TimerKind::B,
            TimerKind::D,
            TimerKind::E,
            TimerKind::F,
            TimerKind::G,
            TimerKind::H,
            TimerKind::I,
            TimerKind::J,
            TimerKind::K,
        ] {
            self.cancel(key, kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigcore_sip::Method;

    fn key() -> TransactionKey {
        TransactionKey::new("z9hG4bK-timer-test", Method::Invite, false)
    }

    #[tokio::test(start_paused = true)]
    async fn armed_timer_fires_after_its_delay() {
        let (wheel, mut fired_rx) = TimerWheel::spawn();
        wheel.arm(key(), TimerKind::A, Duration::from_millis(500));

        tokio::time::advance(Duration::from_millis(600)).await;
        let fired = fired_rx.recv().await.expect("timer A must fire");
        assert_eq!(fired.key, key());
        assert_eq!(fired.kind, TimerKind::A);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_timer_tombstones_it_before_it_fires() {
        let (wheel, mut fired_rx) = TimerWheel::spawn();
        wheel.arm(key(), TimerKind::H, Duration::from_millis(500));
        wheel.cancel(&key(), TimerKind::H);

        tokio::time::advance(Duration::from_millis(600)).await;
        // Give the drained, tombstoned entry a chance to have been
        // delivered if cancellation didn't actually take effect.
        let result = tokio::time::timeout(Duration::from_millis(50), fired_rx.recv()).await;
        assert!(result.is_err(), "a cancelled timer must not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn re_arming_the_same_kind_replaces_the_pending_fire() {
        let (wheel, mut fired_rx) = TimerWheel::spawn();
        wheel.arm(key(), TimerKind::G, Duration::from_millis(200));
        wheel.arm(key(), TimerKind::G, Duration::from_millis(800));

        tokio::time::advance(Duration::from_millis(300)).await;
        let result = tokio::time::timeout(Duration::from_millis(50), fired_rx.recv()).await;
        assert!(result.is_err(), "the first, superseded arming must not fire");

        tokio::time::advance(Duration::from_millis(600)).await;
        let fired = fired_rx.recv().await.expect("the re-armed timer must fire");
        assert_eq!(fired.kind, TimerKind::G);
    }
}
