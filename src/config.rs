use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tracing::warn;

use crate::limits::{MAX_PAYMENT_TIMEOUT, MAX_POLICY_WINDOW};
use crate::model::{Secs, DAY, HOUR, MINUTE};

/// Source of "now". Injected into the engine so tests can pin time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Secs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Secs {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as Secs)
            .unwrap_or(0)
    }
}

/// Manually driven clock.
#[derive(Debug)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    pub fn new(now: Secs) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Secs) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Secs) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Secs {
        self.now.load(Ordering::SeqCst)
    }
}

/// Thresholds the booking engine enforces.
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    /// Minimum notice between now and a slot's start for booking.
    pub lead_time: Secs,
    /// Minimum notice between now and a slot's start for customer cancellation.
    pub cancel_cutoff: Secs,
    /// Furthest into the future a slot may start.
    pub horizon: Secs,
    /// How long a booking may stay unpaid before it is released.
    pub payment_timeout: Duration,
    pub max_slot_minutes: u32,
    pub default_slot_minutes: u32,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            lead_time: 12 * HOUR,
            cancel_cutoff: 12 * HOUR,
            horizon: 365 * DAY,
            payment_timeout: Duration::from_secs((15 * MINUTE) as u64),
            max_slot_minutes: 60,
            default_slot_minutes: 30,
        }
    }
}

impl BookingPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            lead_time: env_parse("SLOTKEEPER_LEAD_TIME_SECS").unwrap_or(d.lead_time),
            cancel_cutoff: env_parse("SLOTKEEPER_CANCEL_CUTOFF_SECS").unwrap_or(d.cancel_cutoff),
            horizon: env_parse("SLOTKEEPER_HORIZON_SECS").unwrap_or(d.horizon),
            payment_timeout: env_parse("SLOTKEEPER_PAYMENT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.payment_timeout),
            max_slot_minutes: env_parse("SLOTKEEPER_MAX_SLOT_MINUTES").unwrap_or(d.max_slot_minutes),
            default_slot_minutes: d.default_slot_minutes,
        }
        .bounded()
    }

    /// Clamp every threshold into the range the engine and the timer wheel
    /// can represent.
    pub fn bounded(self) -> Self {
        let window = |name: &str, v: Secs| {
            let clamped = v.clamp(0, MAX_POLICY_WINDOW);
            if clamped != v {
                warn!("{name} of {v}s out of range, using {clamped}s");
            }
            clamped
        };
        let payment_timeout = self.payment_timeout.min(MAX_PAYMENT_TIMEOUT);
        if payment_timeout != self.payment_timeout {
            warn!(
                "payment timeout of {:?} too long, using {payment_timeout:?}",
                self.payment_timeout
            );
        }
        Self {
            lead_time: window("lead time", self.lead_time),
            cancel_cutoff: window("cancel cutoff", self.cancel_cutoff),
            horizon: window("horizon", self.horizon),
            payment_timeout,
            ..self
        }
    }

    /// Payment timeout rounded up to whole seconds.
    pub fn payment_timeout_secs(&self) -> Secs {
        let t = self.payment_timeout;
        let whole = t.as_secs() as Secs;
        if t.subsec_nanos() > 0 { whole + 1 } else { whole }
    }
}

/// Process-level settings for the binary.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub feed_addr: Option<String>,
    pub payment_contract: Option<String>,
    pub api_keys: String,
    pub feed_queue: usize,
    pub feed_workers: usize,
    pub policy: BookingPolicy,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(
                std::env::var("SLOTKEEPER_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            ),
            compact_threshold: env_parse("SLOTKEEPER_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: env_parse("SLOTKEEPER_METRICS_PORT"),
            feed_addr: std::env::var("SLOTKEEPER_FEED_ADDR").ok(),
            payment_contract: std::env::var("SLOTKEEPER_PAYMENT_CONTRACT").ok(),
            api_keys: std::env::var("SLOTKEEPER_API_KEYS").unwrap_or_default(),
            feed_queue: env_parse("SLOTKEEPER_FEED_QUEUE").unwrap_or(1024),
            feed_workers: env_parse("SLOTKEEPER_FEED_WORKERS").unwrap_or(32),
            policy: BookingPolicy::from_env(),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotkeeper.wal")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
