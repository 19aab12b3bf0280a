use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::auth::ApiKeys;
use crate::engine::{Engine, EngineError};
use crate::model::{PaymentReceipt, PaymentSource};
use crate::observability::{
    FEED_EVENTS_DROPPED_TOTAL, PAYMENTS_MATCHED_TOTAL, PAYMENTS_UNMATCHED_TOTAL,
};

use super::{CorrelationId, LineFeed, PaymentEvent, PaymentFeed, RawLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The payment moved this appointment to `Reserved`.
    Applied(Ulid),
    /// Matched, but the appointment had already left `PendingPayment`.
    AlreadyApplied(Ulid),
    /// No pending appointment carries this correlation id.
    Unmatched,
}

#[derive(Debug)]
pub enum WebhookError {
    MissingCredential,
    InvalidCredential,
    MissingAppointmentId,
    NotPending(String),
    Engine(EngineError),
}

impl std::fmt::Display for WebhookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookError::MissingCredential => write!(f, "API key is required"),
            WebhookError::InvalidCredential => write!(f, "the provided API key is not valid"),
            WebhookError::MissingAppointmentId => write!(f, "appointment id is required"),
            WebhookError::NotPending(id) => write!(f, "appointment {id} is not in pending state"),
            WebhookError::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WebhookError {}

/// Matches payment confirmations to appointments waiting on payment.
///
/// Holds no state of its own: the engine's pending set is the work queue, so
/// a restart only needs a fresh subscription.
pub struct Reconciler {
    engine: Arc<Engine>,
    api_keys: ApiKeys,
    /// Only logs emitted by this address are considered, when set.
    contract: Option<String>,
}

impl Reconciler {
    pub fn new(engine: Arc<Engine>, api_keys: ApiKeys) -> Self {
        Self {
            engine,
            api_keys,
            contract: None,
        }
    }

    pub fn with_contract(mut self, address: impl Into<String>) -> Self {
        self.contract = Some(address.into().to_lowercase());
        self
    }

    /// The pending appointment whose hashed id equals `cid`, if any.
    pub async fn find_pending(&self, cid: &CorrelationId) -> Option<Ulid> {
        self.engine
            .pending_payment_appointments()
            .await
            .into_iter()
            .find(|id| CorrelationId::for_appointment(id) == *cid)
    }

    pub async fn handle_event(&self, event: PaymentEvent) -> Result<MatchOutcome, EngineError> {
        let Some(id) = self.find_pending(&event.correlation_id).await else {
            debug!("no pending appointment for payment {}", event.correlation_id);
            metrics::counter!(PAYMENTS_UNMATCHED_TOTAL).increment(1);
            return Ok(MatchOutcome::Unmatched);
        };
        info!("payment for {id} from {} ({} wei)", event.payer, event.amount);
        let receipt = PaymentReceipt {
            source: PaymentSource::Feed,
            payer: Some(event.payer),
            amount: Some(event.amount),
        };
        match self.engine.process_payment(id, receipt).await {
            Ok(true) => {
                metrics::counter!(PAYMENTS_MATCHED_TOTAL).increment(1);
                Ok(MatchOutcome::Applied(id))
            }
            Ok(false) => Ok(MatchOutcome::AlreadyApplied(id)),
            // Expired between the scan and the transition
            Err(EngineError::NotFound(_)) => Ok(MatchOutcome::Unmatched),
            Err(e) => Err(e),
        }
    }

    /// Decode and apply one raw log. Bad logs are logged and dropped.
    pub async fn handle_log(&self, log: RawLog) -> Option<MatchOutcome> {
        if let Some(contract) = &self.contract
            && log.address.as_deref().map(str::to_lowercase).as_deref() != Some(contract.as_str())
        {
            debug!("ignoring log from {:?}", log.address);
            return None;
        }
        let event = match PaymentEvent::from_log(&log) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping payment event: {e}");
                metrics::counter!(FEED_EVENTS_DROPPED_TOTAL).increment(1);
                return None;
            }
        };
        match self.handle_event(event).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("payment transition failed ({}): {e}", e.kind().as_str());
                None
            }
        }
    }

    /// Webhook fallback: confirm payment for a pending appointment by id.
    pub async fn webhook(
        &self,
        credential: Option<&str>,
        appointment_id: Option<&str>,
    ) -> Result<Ulid, WebhookError> {
        let credential = credential.ok_or(WebhookError::MissingCredential)?;
        if !self.api_keys.accepts(credential) {
            return Err(WebhookError::InvalidCredential);
        }
        let raw = appointment_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(WebhookError::MissingAppointmentId)?;
        let not_pending = || WebhookError::NotPending(raw.to_owned());
        let id = Ulid::from_string(raw).map_err(|_| not_pending())?;
        if !self.engine.pending_payment_appointments().await.contains(&id) {
            return Err(not_pending());
        }
        match self.engine.process_payment(id, PaymentReceipt::webhook()).await {
            Ok(true) => {
                info!("payment for {id} confirmed by webhook");
                metrics::counter!(PAYMENTS_MATCHED_TOTAL).increment(1);
                Ok(id)
            }
            Ok(false) | Err(EngineError::NotFound(_)) => Err(not_pending()),
            Err(e) => Err(WebhookError::Engine(e)),
        }
    }

    /// Drain a feed until it ends. Ingestion only parses and enqueues; each
    /// log is handled in its own task, at most `workers` at a time, so a slow
    /// match never stalls the subscription.
    pub async fn run<F: PaymentFeed>(self: Arc<Self>, mut feed: F, queue: usize, workers: usize) {
        let workers = workers.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize));
        let (tx, mut rx) = mpsc::channel::<RawLog>(queue.max(1));
        let permits = Arc::new(Semaphore::new(workers));

        let me = self.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(log) = rx.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else { break };
                let me = me.clone();
                tokio::spawn(async move {
                    let _permit = permit; // held until the handler finishes
                    me.handle_log(log).await;
                });
            }
            // Wait for in-flight handlers
            let _ = permits.acquire_many(workers as u32).await;
        });

        while let Some(item) = feed.next_log().await {
            match item {
                Ok(log) => {
                    if tx.send(log).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("dropping payment event: {e}");
                    metrics::counter!(FEED_EVENTS_DROPPED_TOTAL).increment(1);
                }
            }
        }
        drop(tx);
        if let Err(e) = dispatcher.await {
            error!("payment dispatcher failed: {e}");
        }
    }
}

const RESUBSCRIBE_MIN: Duration = Duration::from_millis(500);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(30);

/// Keep a JSON-lines subscription to `addr` alive forever, reconnecting with
/// capped exponential back-off. Each connection starts at the feed's head.
pub async fn follow_feed(reconciler: Arc<Reconciler>, addr: String, queue: usize, workers: usize) {
    let mut backoff = RESUBSCRIBE_MIN;
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!("subscribed to payment feed at {addr}");
                backoff = RESUBSCRIBE_MIN;
                reconciler
                    .clone()
                    .run(LineFeed::new(stream), queue, workers)
                    .await;
                warn!("payment feed at {addr} closed, resubscribing");
            }
            Err(e) => warn!("payment feed at {addr} unreachable: {e}"),
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RESUBSCRIBE_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Caller;
    use crate::config::{BookingPolicy, FixedClock};
    use crate::model::{AppointmentStatus, DAY};
    use crate::notify::NotifyHub;
    use crate::payment::ChannelFeed;

    const NOW: i64 = 1_800_000_000;
    const PAYER: &str = "0x00000000000000000000000000000000000000aa";
    const CONTRACT: &str = "0x00000000000000000000000000000000000000c0";

    async fn setup(name: &str) -> (Arc<Engine>, Ulid) {
        let dir = std::env::temp_dir().join("slotkeeper_test_reconciler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        let engine = Engine::open(
            path,
            BookingPolicy::default(),
            Arc::new(FixedClock::new(NOW)),
            Arc::new(NotifyHub::new()),
        )
        .unwrap();
        let customer = engine
            .register_customer("Payer", "payer@example.com")
            .await
            .unwrap();
        let slot = engine
            .create_slot(&Caller::Admin, NOW + 2 * DAY, None)
            .await
            .unwrap();
        let appt = engine
            .create_appointment(&Caller::Customer(customer.id), slot.id)
            .await
            .unwrap();
        (engine, appt.id)
    }

    fn paid(id: &Ulid, amount: u128) -> PaymentEvent {
        PaymentEvent {
            correlation_id: CorrelationId::for_appointment(id),
            payer: PAYER.into(),
            amount,
        }
    }

    async fn status(engine: &Engine, id: Ulid) -> AppointmentStatus {
        engine.get_appointment(&Caller::Admin, id).await.unwrap().status
    }

    #[tokio::test]
    async fn matching_log_reserves_appointment() {
        let (engine, id) = setup("match.wal").await;
        let reconciler = Reconciler::new(engine.clone(), ApiKeys::default());

        let outcome = reconciler.handle_log(paid(&id, 250).to_log(None)).await;
        assert_eq!(outcome, Some(MatchOutcome::Applied(id)));

        let appt = engine.get_appointment(&Caller::Admin, id).await.unwrap();
        assert_eq!(appt.status, AppointmentStatus::Reserved);
        let receipt = appt.receipt.unwrap();
        assert_eq!(receipt.source, PaymentSource::Feed);
        assert_eq!(receipt.payer.as_deref(), Some(PAYER));
        assert_eq!(receipt.amount, Some(250));
    }

    #[tokio::test]
    async fn redelivered_payment_is_not_reapplied() {
        let (engine, id) = setup("redelivery.wal").await;
        let reconciler = Reconciler::new(engine.clone(), ApiKeys::default());

        assert_eq!(reconciler.handle_event(paid(&id, 1)).await.unwrap(), MatchOutcome::Applied(id));
        // No longer pending, so the second delivery finds nothing to match
        assert_eq!(reconciler.handle_event(paid(&id, 1)).await.unwrap(), MatchOutcome::Unmatched);
        assert_eq!(status(&engine, id).await, AppointmentStatus::Reserved);
    }

    #[tokio::test]
    async fn unknown_correlation_id_is_unmatched() {
        let (engine, id) = setup("unmatched.wal").await;
        let reconciler = Reconciler::new(engine.clone(), ApiKeys::default());

        let outcome = reconciler.handle_event(paid(&Ulid::new(), 1)).await.unwrap();
        assert_eq!(outcome, MatchOutcome::Unmatched);
        assert_eq!(status(&engine, id).await, AppointmentStatus::PendingPayment);
    }

    #[tokio::test]
    async fn contract_filter_ignores_other_emitters() {
        let (engine, id) = setup("contract.wal").await;
        let reconciler =
            Reconciler::new(engine.clone(), ApiKeys::default()).with_contract(CONTRACT.to_uppercase());

        let stranger = paid(&id, 1).to_log(Some("0x00000000000000000000000000000000000000ff"));
        assert_eq!(reconciler.handle_log(stranger).await, None);
        let anonymous = paid(&id, 1).to_log(None);
        assert_eq!(reconciler.handle_log(anonymous).await, None);
        assert_eq!(status(&engine, id).await, AppointmentStatus::PendingPayment);

        let ours = paid(&id, 1).to_log(Some(CONTRACT));
        assert_eq!(reconciler.handle_log(ours).await, Some(MatchOutcome::Applied(id)));
    }

    #[tokio::test]
    async fn malformed_log_does_not_stop_the_feed() {
        let (engine, id) = setup("malformed.wal").await;
        let reconciler = Arc::new(Reconciler::new(engine.clone(), ApiKeys::default()));
        let (tx, feed) = ChannelFeed::new(8);

        let mut wrong_signature = paid(&id, 1).to_log(None);
        wrong_signature.topics[0] = format!("0x{}", "11".repeat(32));
        let mut truncated = paid(&id, 1).to_log(None);
        truncated.topics.truncate(1);

        tx.send(wrong_signature).await.unwrap();
        tx.send(truncated).await.unwrap();
        tx.send(paid(&id, 7).to_log(None)).await.unwrap();
        drop(tx);

        reconciler.run(feed, 4, 2).await;
        assert_eq!(status(&engine, id).await, AppointmentStatus::Reserved);
    }

    #[tokio::test]
    async fn webhook_validates_request() {
        let (engine, id) = setup("webhook.wal").await;
        let reconciler = Reconciler::new(engine.clone(), ApiKeys::parse("k1, k2"));
        let raw = id.to_string();

        assert!(matches!(
            reconciler.webhook(None, Some(&raw)).await,
            Err(WebhookError::MissingCredential)
        ));
        assert!(matches!(
            reconciler.webhook(Some("nope"), Some(&raw)).await,
            Err(WebhookError::InvalidCredential)
        ));
        assert!(matches!(
            reconciler.webhook(Some("k2"), None).await,
            Err(WebhookError::MissingAppointmentId)
        ));
        assert!(matches!(
            reconciler.webhook(Some("k2"), Some("  ")).await,
            Err(WebhookError::MissingAppointmentId)
        ));
        assert!(matches!(
            reconciler.webhook(Some("k2"), Some("not-an-id")).await,
            Err(WebhookError::NotPending(_))
        ));
        let stranger = Ulid::new().to_string();
        assert!(matches!(
            reconciler.webhook(Some("k2"), Some(&stranger)).await,
            Err(WebhookError::NotPending(_))
        ));
        assert_eq!(status(&engine, id).await, AppointmentStatus::PendingPayment);
    }

    #[tokio::test]
    async fn webhook_confirms_pending_once() {
        let (engine, id) = setup("webhook_once.wal").await;
        let reconciler = Reconciler::new(engine.clone(), ApiKeys::parse("secret"));
        let raw = id.to_string();

        assert_eq!(reconciler.webhook(Some("secret"), Some(&raw)).await.unwrap(), id);
        let appt = engine.get_appointment(&Caller::Admin, id).await.unwrap();
        assert_eq!(appt.status, AppointmentStatus::Reserved);
        assert_eq!(appt.receipt.unwrap().source, PaymentSource::Webhook);

        let again = reconciler.webhook(Some("secret"), Some(&raw)).await;
        assert!(matches!(again, Err(WebhookError::NotPending(s)) if s == raw));
    }
}
