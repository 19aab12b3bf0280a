mod error;
mod mutations;
mod policy;
mod queries;

pub use error::{EngineError, ErrorKind};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::config::{BookingPolicy, Clock};
use crate::expiry::{self, ExpiryHandle};
use crate::model::*;
use crate::notify::{NotifiedStatus, Notification, NotifyHub};
use crate::wal::Wal;

pub type SharedSlotState = Arc<RwLock<SlotState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Control(WalControl),
}

/// Writer requests that are not appends and never join a batch.
pub(super) enum WalControl {
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL and batches appends: wait for one, drain whatever else is
/// already queued, then fsync once for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            WalCommand::Control(ctl) => {
                handle_control(&mut wal, ctl);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(WalCommand::Control(ctl)) => {
                    deferred = Some(ctl);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(ctl) = deferred {
            handle_control(&mut wal, ctl);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stale bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_control(wal: &mut Wal, ctl: WalControl) {
    match ctl {
        WalControl::Compact { events, response } => {
            let written = Wal::write_compact_file(wal.path(), &events);
            let _ = response.send(written.and_then(|()| wal.swap_compact_file()));
        }
        WalControl::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

/// Booking engine: owns the slot and appointment stores and every guarded
/// transition between appointment states.
///
/// Each appointment lives inside its slot's `SlotState`, so the slot write
/// lock is the unit of atomicity: a transition takes it, checks the current
/// status, appends to the WAL, applies, and only then lets go.
pub struct Engine {
    pub(super) slots: DashMap<Ulid, SharedSlotState>,
    /// Sorted slot spans. Held for writing while slots are created or deleted.
    pub(super) calendar: RwLock<Calendar>,
    /// Reverse lookup: appointment id → slot id
    pub(super) appointment_to_slot: DashMap<Ulid, Ulid>,
    pub(super) customers: DashMap<Ulid, Customer>,
    pub(super) customer_names: DashMap<String, Ulid>,
    pub(super) customer_emails: DashMap<String, Ulid>,
    /// Serializes customer registration so uniqueness checks and insert agree.
    pub(super) registration: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) policy: BookingPolicy,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) expiry: ExpiryHandle,
}

/// Apply a slot-scoped event to its slot (caller holds the lock).
fn apply_to_slot(st: &mut SlotState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::AppointmentCreated {
            id,
            slot_id,
            customer_id,
            created_at,
        } => {
            st.hold(Appointment {
                id: *id,
                slot_id: *slot_id,
                customer_id: *customer_id,
                status: AppointmentStatus::PendingPayment,
                created_at: *created_at,
                receipt: None,
            });
            index.insert(*id, *slot_id);
        }
        Event::AppointmentPaid { id, receipt, .. } => {
            if let Some(appt) = st.appointment_mut(*id) {
                appt.status = AppointmentStatus::Reserved;
                appt.receipt = Some(receipt.clone());
            }
        }
        Event::AppointmentConfirmed { id, .. } => {
            if let Some(appt) = st.appointment_mut(*id) {
                appt.status = AppointmentStatus::Confirmed;
            }
        }
        Event::AppointmentRemoved { id, .. } => {
            if st.appointment_mut(*id).is_some() {
                st.release();
                index.remove(id);
            }
        }
        // Customer and slot lifecycle events live outside a single slot
        Event::CustomerRegistered { .. } | Event::SlotCreated { .. } | Event::SlotDeleted { .. } => {}
    }
    debug_assert!(st.is_consistent(), "slot {} flag disagrees with its hold", st.slot.id);
}

fn event_slot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::AppointmentCreated { slot_id, .. }
        | Event::AppointmentPaid { slot_id, .. }
        | Event::AppointmentConfirmed { slot_id, .. }
        | Event::AppointmentRemoved { slot_id, .. } => Some(*slot_id),
        Event::CustomerRegistered { .. } | Event::SlotCreated { .. } | Event::SlotDeleted { .. } => None,
    }
}

fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

impl Engine {
    /// Replay the WAL, start the WAL writer and the expiry scheduler, and
    /// re-arm timers for every appointment still waiting on payment.
    pub fn open(
        wal_path: PathBuf,
        policy: BookingPolicy,
        clock: Arc<dyn Clock>,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Arc<Self>> {
        let policy = policy.bounded();
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let (expiry, timer_rx) = expiry::channel();
        let index = DashMap::new();
        let customers = DashMap::new();
        let customer_names = DashMap::new();
        let customer_emails = DashMap::new();
        let mut slots: HashMap<Ulid, SlotState> = HashMap::new();

        for event in &events {
            match event {
                Event::CustomerRegistered { id, name, email } => {
                    customer_names.insert(name.clone(), *id);
                    customer_emails.insert(email_key(email), *id);
                    customers.insert(
                        *id,
                        Customer {
                            id: *id,
                            name: name.clone(),
                            email: email.clone(),
                        },
                    );
                }
                Event::SlotCreated { id, span } => {
                    slots.insert(*id, SlotState::new(*id, *span));
                }
                Event::SlotDeleted { id } => {
                    slots.remove(id);
                }
                other => {
                    if let Some(st) = event_slot_id(other).and_then(|sid| slots.get_mut(&sid)) {
                        apply_to_slot(st, other, &index);
                    }
                }
            }
        }

        let mut calendar = Calendar::new();
        let shared = DashMap::new();
        for (id, st) in slots {
            calendar.insert(st.slot.span, id);
            shared.insert(id, Arc::new(RwLock::new(st)));
        }

        let engine = Arc::new(Self {
            slots: shared,
            calendar: RwLock::new(calendar),
            appointment_to_slot: index,
            customers,
            customer_names,
            customer_emails,
            registration: Mutex::new(()),
            wal_tx,
            notify,
            policy,
            clock,
            expiry,
        });

        tokio::spawn(expiry::run_expiry(Arc::downgrade(&engine), timer_rx));
        engine.rearm_pending();
        Ok(engine)
    }

    pub(super) fn now(&self) -> Secs {
        self.clock.now()
    }

    /// Arm a timer for every pending appointment, with whatever is left of
    /// its payment window measured from its persisted creation time.
    fn rearm_pending(&self) {
        let now = self.now();
        let timeout = self.policy.payment_timeout_secs();
        let mut armed = 0usize;
        for entry in self.slots.iter() {
            let Ok(guard) = entry.value().try_read() else { continue };
            if let Some(appt) = &guard.appointment
                && appt.status == AppointmentStatus::PendingPayment
            {
                let remaining = (appt.created_at + timeout - now).max(0);
                self.expiry.arm(appt.id, Duration::from_secs(remaining as u64));
                armed += 1;
            }
        }
        if armed > 0 {
            tracing::info!("re-armed {armed} payment timers after replay");
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. Nothing changes in memory if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        st: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_slot(st, event, &self.appointment_to_slot);
        Ok(())
    }

    pub(super) fn get_slot_state(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of all slot handles; never hold a map guard across an await.
    pub(super) fn slot_states(&self) -> Vec<SharedSlotState> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    /// Write-lock a slot, making sure it was not deleted while we waited.
    pub(super) async fn lock_slot(
        &self,
        slot_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let st = self
            .get_slot_state(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = st.clone().write_owned().await;
        match self.slots.get(&slot_id) {
            Some(current) if Arc::ptr_eq(current.value(), &st) => Ok(guard),
            _ => Err(EngineError::NotFound(slot_id)),
        }
    }

    /// Appointment id → its slot, write-locked, with the appointment verified
    /// to still be the one holding the slot.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let slot_id = self
            .appointment_to_slot
            .get(&appointment_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(appointment_id))?;
        let mut guard = self
            .lock_slot(slot_id)
            .await
            .map_err(|_| EngineError::NotFound(appointment_id))?;
        if guard.appointment_mut(appointment_id).is_none() {
            return Err(EngineError::NotFound(appointment_id));
        }
        Ok(guard)
    }

    pub(super) fn send_notification(&self, appt: &Appointment, slot: &Slot, status: NotifiedStatus) {
        self.notify.send(Notification {
            appointment_id: appt.id,
            customer_id: appt.customer_id,
            slot: SlotInfo::from(slot),
            status,
        });
    }
}
