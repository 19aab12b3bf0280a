use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{oneshot, OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::auth::Caller;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifiedStatus;
use crate::observability::TRANSITIONS_TOTAL;

use super::policy::{check_bookable, check_cancellable, new_slot_span, validate_email, validate_name};
use super::{email_key, Engine, EngineError, WalCommand, WalControl};

fn require_admin(caller: &Caller) -> Result<(), EngineError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Unauthorized("admin only"))
    }
}

fn require_customer(caller: &Caller) -> Result<Ulid, EngineError> {
    caller
        .customer_id()
        .ok_or(EngineError::Unauthorized("customer only"))
}

fn count_transition(name: &'static str) {
    metrics::counter!(TRANSITIONS_TOTAL, "transition" => name).increment(1);
}

impl Engine {
    pub async fn register_customer(&self, name: &str, email: &str) -> Result<Customer, EngineError> {
        let name = name.trim();
        let email = email.trim();
        validate_name(name)?;
        validate_email(email)?;

        let _registering = self.registration.lock().await;
        if self.customers.len() >= MAX_CUSTOMERS {
            return Err(EngineError::LimitExceeded("too many customers"));
        }
        if self.customer_names.contains_key(name) {
            return Err(EngineError::AlreadyExists("customer name"));
        }
        if self.customer_emails.contains_key(&email_key(email)) {
            return Err(EngineError::AlreadyExists("email address"));
        }

        let customer = Customer {
            id: Ulid::new(),
            name: name.to_owned(),
            email: email.to_owned(),
        };
        self.wal_append(&Event::CustomerRegistered {
            id: customer.id,
            name: customer.name.clone(),
            email: customer.email.clone(),
        })
        .await?;
        self.customer_names.insert(customer.name.clone(), customer.id);
        self.customer_emails.insert(email_key(email), customer.id);
        self.customers.insert(customer.id, customer.clone());
        Ok(customer)
    }

    /// Create a slot starting at `start`. `duration_minutes` defaults to the
    /// policy's default slot length.
    pub async fn create_slot(
        &self,
        caller: &Caller,
        start: Secs,
        duration_minutes: Option<u32>,
    ) -> Result<SlotInfo, EngineError> {
        require_admin(caller)?;
        let minutes = duration_minutes.unwrap_or(self.policy.default_slot_minutes);
        let span = new_slot_span(&self.policy, start, minutes, self.now())?;

        let mut calendar = self.calendar.write().await;
        if calendar.len() >= MAX_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        if let Some((_, other)) = calendar.overlapping(&span).next() {
            return Err(EngineError::Overlap(*other));
        }

        let id = Ulid::new();
        self.wal_append(&Event::SlotCreated { id, span }).await?;
        let st = SlotState::new(id, span);
        let info = SlotInfo::from(&st.slot);
        self.slots.insert(id, Arc::new(RwLock::new(st)));
        calendar.insert(span, id);
        count_transition("slot_created");
        Ok(info)
    }

    /// Delete a free slot. `Ok(false)` if there is no such slot.
    pub async fn delete_slot(&self, caller: &Caller, slot_id: Ulid) -> Result<bool, EngineError> {
        require_admin(caller)?;
        let mut calendar = self.calendar.write().await;
        let guard = match self.lock_slot(slot_id).await {
            Ok(guard) => guard,
            Err(EngineError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if guard.appointment.is_some() || !guard.slot.available {
            return Err(EngineError::SlotInUse(slot_id));
        }

        self.wal_append(&Event::SlotDeleted { id: slot_id }).await?;
        self.slots.remove(&slot_id);
        calendar.remove(slot_id);
        count_transition("slot_deleted");
        Ok(true)
    }

    /// Book a free slot for the calling customer. The new appointment waits
    /// for payment and is released automatically once the payment window
    /// passes.
    pub async fn create_appointment(
        &self,
        caller: &Caller,
        slot_id: Ulid,
    ) -> Result<AppointmentInfo, EngineError> {
        let customer_id = require_customer(caller)?;
        if !self.customers.contains_key(&customer_id) {
            return Err(EngineError::NotFound(customer_id));
        }

        let mut guard = self.lock_slot(slot_id).await?;
        if !guard.slot.available {
            return Err(EngineError::SlotUnavailable(slot_id));
        }
        if guard.appointment.is_some() {
            // Flag disagrees with the hold; trust the hold.
            warn!("slot {slot_id} marked available while held, repairing");
            guard.slot.available = false;
            return Err(EngineError::SlotUnavailable(slot_id));
        }
        let now = self.now();
        check_bookable(&self.policy, &guard.slot.span, now)?;

        let id = Ulid::new();
        let event = Event::AppointmentCreated {
            id,
            slot_id,
            customer_id,
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        self.expiry.arm(id, self.policy.payment_timeout);

        let Some(appt) = guard.appointment.as_ref() else {
            return Err(EngineError::NotFound(id));
        };
        self.send_notification(appt, &guard.slot, NotifiedStatus::PendingPayment);
        count_transition("created");
        Ok(AppointmentInfo::new(appt, &guard.slot))
    }

    /// Customer cancellation, allowed in any status until the cutoff.
    pub async fn cancel_appointment(
        &self,
        caller: &Caller,
        appointment_id: Ulid,
    ) -> Result<bool, EngineError> {
        let customer_id = require_customer(caller)?;
        let mut guard = self.resolve_appointment_write(appointment_id).await?;
        let owner = guard.appointment.as_ref().map(|a| a.customer_id);
        if owner != Some(customer_id) {
            return Err(EngineError::NotOwner(appointment_id));
        }
        check_cancellable(&self.policy, &guard.slot.span, self.now())?;

        self.remove_held(&mut guard, appointment_id, RemovalReason::CancelledByCustomer)
            .await?;
        Ok(true)
    }

    /// Reserved → Confirmed.
    pub async fn confirm_appointment(
        &self,
        caller: &Caller,
        appointment_id: Ulid,
    ) -> Result<AppointmentInfo, EngineError> {
        require_admin(caller)?;
        let mut guard = self.resolve_appointment_write(appointment_id).await?;
        let status = guard.appointment.as_ref().map(|a| a.status);
        if status != Some(AppointmentStatus::Reserved) {
            return Err(EngineError::NotReserved(appointment_id));
        }

        let slot_id = guard.slot.id;
        let event = Event::AppointmentConfirmed {
            id: appointment_id,
            slot_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        let Some(appt) = guard.appointment.as_ref() else {
            return Err(EngineError::NotFound(appointment_id));
        };
        self.send_notification(appt, &guard.slot, appt.status.into());
        count_transition("confirmed");
        Ok(AppointmentInfo::new(appt, &guard.slot))
    }

    /// Administrative release in any status. `Ok(false)` if already gone.
    pub async fn delete_appointment(
        &self,
        caller: &Caller,
        appointment_id: Ulid,
    ) -> Result<bool, EngineError> {
        require_admin(caller)?;
        let mut guard = match self.resolve_appointment_write(appointment_id).await {
            Ok(guard) => guard,
            Err(EngineError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.remove_held(&mut guard, appointment_id, RemovalReason::DeletedByAdmin)
            .await?;
        Ok(true)
    }

    /// PendingPayment → Reserved. Returns `Ok(false)` when the appointment has
    /// already moved on, so repeated deliveries of one payment are harmless.
    pub async fn process_payment(
        &self,
        appointment_id: Ulid,
        receipt: PaymentReceipt,
    ) -> Result<bool, EngineError> {
        let mut guard = self.resolve_appointment_write(appointment_id).await?;
        let status = guard.appointment.as_ref().map(|a| a.status);
        if status != Some(AppointmentStatus::PendingPayment) {
            debug!("payment for {appointment_id} ignored, status is {status:?}");
            return Ok(false);
        }

        let slot_id = guard.slot.id;
        let event = Event::AppointmentPaid {
            id: appointment_id,
            slot_id,
            receipt,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        self.expiry.disarm(appointment_id);

        if let Some(appt) = guard.appointment.as_ref() {
            self.send_notification(appt, &guard.slot, appt.status.into());
        }
        count_transition("paid");
        Ok(true)
    }

    /// Release the slot if the appointment is still waiting on payment.
    /// `Ok(false)` if it is gone or already paid.
    pub async fn cancel_if_not_paid(&self, appointment_id: Ulid) -> Result<bool, EngineError> {
        let mut guard = match self.resolve_appointment_write(appointment_id).await {
            Ok(guard) => guard,
            Err(EngineError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let status = guard.appointment.as_ref().map(|a| a.status);
        if status != Some(AppointmentStatus::PendingPayment) {
            return Ok(false);
        }
        self.remove_held(&mut guard, appointment_id, RemovalReason::Expired)
            .await?;
        Ok(true)
    }

    /// Delete the appointment holding `st` and free the slot.
    async fn remove_held(
        &self,
        st: &mut SlotState,
        appointment_id: Ulid,
        reason: RemovalReason,
    ) -> Result<(), EngineError> {
        let event = Event::AppointmentRemoved {
            id: appointment_id,
            slot_id: st.slot.id,
            reason,
        };
        let Some(appt) = st.appointment.clone() else {
            return Err(EngineError::NotFound(appointment_id));
        };
        self.persist_and_apply(st, &event).await?;
        self.expiry.disarm(appointment_id);
        self.send_notification(&appt, &st.slot, NotifiedStatus::Cancelled);
        count_transition(reason.as_str());
        Ok(())
    }

    /// Rewrite the WAL as a snapshot of current state.
    ///
    /// Holds the calendar, the registration lock and a read lock on every slot
    /// until the writer has swapped files, so no append can land between the
    /// snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let calendar = self.calendar.write().await;
        let _registering = self.registration.lock().await;

        let mut events: Vec<Event> = self
            .customers
            .iter()
            .map(|c| Event::CustomerRegistered {
                id: c.id,
                name: c.name.clone(),
                email: c.email.clone(),
            })
            .collect();

        let mut seen = HashSet::new();
        let mut guards: Vec<OwnedRwLockReadGuard<SlotState>> = Vec::with_capacity(calendar.len());
        for (_, slot_id) in calendar.iter() {
            if !seen.insert(*slot_id) {
                continue;
            }
            let Some(st) = self.get_slot_state(slot_id) else { continue };
            guards.push(st.read_owned().await);
        }

        for guard in &guards {
            let slot_id = guard.slot.id;
            events.push(Event::SlotCreated {
                id: slot_id,
                span: guard.slot.span,
            });
            let Some(appt) = &guard.appointment else { continue };
            events.push(Event::AppointmentCreated {
                id: appt.id,
                slot_id,
                customer_id: appt.customer_id,
                created_at: appt.created_at,
            });
            if let Some(receipt) = &appt.receipt {
                events.push(Event::AppointmentPaid {
                    id: appt.id,
                    slot_id,
                    receipt: receipt.clone(),
                });
            }
            if appt.status == AppointmentStatus::Confirmed {
                events.push(Event::AppointmentConfirmed { id: appt.id, slot_id });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Control(WalControl::Compact { events, response: tx }))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        info!("compacted WAL to {} slots", calendar.len());
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::Control(WalControl::AppendsSinceCompact { response: tx }))
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
