use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::Engine;
use crate::observability::{EXPIRED_TOTAL, PENDING_TIMERS};

/// Cap on a single delay. `DelayQueue` panics past roughly two years.
const MAX_TIMER_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug)]
pub enum TimerCommand {
    Arm { id: Ulid, delay: Duration },
    Disarm { id: Ulid },
}

/// Engine-side handle to the expiry scheduler. Sending never blocks.
#[derive(Debug, Clone)]
pub struct ExpiryHandle {
    tx: mpsc::UnboundedSender<TimerCommand>,
}

pub fn channel() -> (ExpiryHandle, mpsc::UnboundedReceiver<TimerCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ExpiryHandle { tx }, rx)
}

impl ExpiryHandle {
    /// Fire once for `id` after `delay`. Re-arming an armed id restarts its
    /// delay rather than adding a second timer.
    pub fn arm(&self, id: Ulid, delay: Duration) {
        if self.tx.send(TimerCommand::Arm { id, delay }).is_err() {
            warn!("expiry scheduler stopped, {id} will not be released automatically");
        }
    }

    /// Drop the timer for `id`, if any.
    pub fn disarm(&self, id: Ulid) {
        let _ = self.tx.send(TimerCommand::Disarm { id });
    }
}

/// Timers keyed by appointment id, at most one each.
#[derive(Default)]
struct Timers {
    queue: DelayQueue<Ulid>,
    keys: HashMap<Ulid, Key>,
}

impl Timers {
    fn apply(&mut self, cmd: TimerCommand) {
        match cmd {
            TimerCommand::Arm { id, delay } => {
                let delay = delay.min(MAX_TIMER_DELAY);
                match self.keys.get(&id) {
                    Some(key) => self.queue.reset(key, delay),
                    None => {
                        let key = self.queue.insert(id, delay);
                        self.keys.insert(id, key);
                    }
                }
            }
            TimerCommand::Disarm { id } => {
                if let Some(key) = self.keys.remove(&id) {
                    self.queue.remove(&key);
                }
            }
        }
    }

    async fn next_expired(&mut self) -> Option<Ulid> {
        let expired = std::future::poll_fn(|cx| self.queue.poll_expired(cx)).await?;
        let id = expired.into_inner();
        self.keys.remove(&id);
        Some(id)
    }
}

/// Background task owning every payment timer. Each expiry runs the engine's
/// guarded cancellation, so a timer that outlives its pending state is a no-op.
/// Exits once the engine is gone.
pub async fn run_expiry(engine: Weak<Engine>, mut rx: mpsc::UnboundedReceiver<TimerCommand>) {
    let mut timers = Timers::default();
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => timers.apply(cmd),
                None => break,
            },
            Some(id) = timers.next_expired(), if !timers.keys.is_empty() => {
                let Some(engine) = engine.upgrade() else { break };
                tokio::spawn(release_if_unpaid(engine, id));
            }
        }
        metrics::gauge!(PENDING_TIMERS).set(timers.keys.len() as f64);
    }
    debug!("expiry scheduler stopped");
}

async fn release_if_unpaid(engine: Arc<Engine>, id: Ulid) {
    match engine.cancel_if_not_paid(id).await {
        Ok(true) => {
            info!("released unpaid appointment {id}");
            metrics::counter!(EXPIRED_TOTAL).increment(1);
        }
        Ok(false) => debug!("expiry for {id} is stale"),
        Err(e) => warn!("expiry of {id} failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timers_fire_once_in_order() {
        let mut timers = Timers::default();
        let (a, b) = (Ulid::new(), Ulid::new());
        timers.apply(TimerCommand::Arm { id: b, delay: Duration::from_millis(40) });
        timers.apply(TimerCommand::Arm { id: a, delay: Duration::from_millis(10) });
        // Re-arming keeps a single entry
        timers.apply(TimerCommand::Arm { id: a, delay: Duration::from_millis(20) });
        assert_eq!(timers.keys.len(), 2);

        assert_eq!(timers.next_expired().await, Some(a));
        assert_eq!(timers.next_expired().await, Some(b));
        assert!(timers.keys.is_empty());
    }

    #[tokio::test]
    async fn disarmed_timer_never_fires() {
        let mut timers = Timers::default();
        let (a, b) = (Ulid::new(), Ulid::new());
        timers.apply(TimerCommand::Arm { id: a, delay: Duration::from_millis(10) });
        timers.apply(TimerCommand::Arm { id: b, delay: Duration::from_millis(30) });
        timers.apply(TimerCommand::Disarm { id: a });
        // Disarming twice is harmless
        timers.apply(TimerCommand::Disarm { id: a });

        assert_eq!(timers.next_expired().await, Some(b));
        assert!(timers.keys.is_empty());
    }

    #[tokio::test]
    async fn oversized_delay_is_capped() {
        let mut timers = Timers::default();
        let (far, near) = (Ulid::new(), Ulid::new());
        timers.apply(TimerCommand::Arm { id: far, delay: Duration::from_secs(3 * 365 * 24 * 60 * 60) });
        timers.apply(TimerCommand::Arm { id: far, delay: Duration::MAX });
        timers.apply(TimerCommand::Arm { id: near, delay: Duration::from_millis(10) });
        assert_eq!(timers.keys.len(), 2);
        assert_eq!(timers.next_expired().await, Some(near));
    }

    #[tokio::test]
    async fn fire_waits_for_delay() {
        let mut timers = Timers::default();
        let id = Ulid::new();
        let started = tokio::time::Instant::now();
        timers.apply(TimerCommand::Arm { id, delay: Duration::from_millis(100) });
        assert_eq!(timers.next_expired().await, Some(id));
        // DelayQueue works at millisecond granularity
        assert!(started.elapsed() >= Duration::from_millis(98));
    }
}
