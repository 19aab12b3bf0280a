use ulid::Ulid;

use crate::auth::Caller;
use crate::model::*;

use super::{email_key, Engine, EngineError};

impl Engine {
    /// Slots ordered by start. `start` keeps slots starting at or after it,
    /// `end` keeps slots ending at or before it.
    pub async fn list_slots(
        &self,
        start: Option<Secs>,
        end: Option<Secs>,
        available: Option<bool>,
    ) -> Vec<SlotInfo> {
        let calendar = self.calendar.read().await;
        let mut out = Vec::new();
        for (span, slot_id) in calendar.iter() {
            if start.is_some_and(|s| span.start < s) || end.is_some_and(|e| span.end > e) {
                continue;
            }
            let Some(st) = self.get_slot_state(slot_id) else { continue };
            let guard = st.read().await;
            if available.is_none_or(|a| guard.slot.available == a) {
                out.push(SlotInfo::from(&guard.slot));
            }
        }
        out
    }

    pub async fn get_slot(&self, slot_id: Ulid) -> Result<SlotInfo, EngineError> {
        let st = self
            .get_slot_state(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = st.read().await;
        Ok(SlotInfo::from(&guard.slot))
    }

    /// Admins may read any appointment, customers only their own.
    pub async fn get_appointment(
        &self,
        caller: &Caller,
        appointment_id: Ulid,
    ) -> Result<AppointmentInfo, EngineError> {
        let slot_id = self
            .appointment_to_slot
            .get(&appointment_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(appointment_id))?;
        let st = self
            .get_slot_state(&slot_id)
            .ok_or(EngineError::NotFound(appointment_id))?;
        let guard = st.read().await;
        let appt = guard
            .appointment
            .as_ref()
            .filter(|a| a.id == appointment_id)
            .ok_or(EngineError::NotFound(appointment_id))?;
        if let Some(customer_id) = caller.customer_id()
            && appt.customer_id != customer_id
        {
            return Err(EngineError::NotOwner(appointment_id));
        }
        Ok(AppointmentInfo::new(appt, &guard.slot))
    }

    /// Appointments ordered by slot start. An admin sees all of them, a
    /// customer only their own. An empty `statuses` means every status.
    pub async fn list_appointments(
        &self,
        caller: &Caller,
        statuses: &[AppointmentStatus],
        start: Option<Secs>,
        end: Option<Secs>,
    ) -> Result<Vec<AppointmentInfo>, EngineError> {
        let only_customer = caller.customer_id();
        if let Some(id) = only_customer
            && !self.customers.contains_key(&id)
        {
            return Err(EngineError::NotFound(id));
        }

        let calendar = self.calendar.read().await;
        let mut out = Vec::new();
        for (span, slot_id) in calendar.iter() {
            if start.is_some_and(|s| span.start < s) || end.is_some_and(|e| span.end > e) {
                continue;
            }
            let Some(st) = self.get_slot_state(slot_id) else { continue };
            let guard = st.read().await;
            let Some(appt) = &guard.appointment else { continue };
            if only_customer.is_some_and(|c| c != appt.customer_id) {
                continue;
            }
            if !statuses.is_empty() && !statuses.contains(&appt.status) {
                continue;
            }
            out.push(AppointmentInfo::new(appt, &guard.slot));
        }
        Ok(out)
    }

    /// Ids of every appointment still waiting on payment. This set is the
    /// reconciler's whole work queue.
    pub async fn pending_payment_appointments(&self) -> Vec<Ulid> {
        let mut pending = Vec::new();
        for st in self.slot_states() {
            let guard = st.read().await;
            if let Some(appt) = &guard.appointment
                && appt.status == AppointmentStatus::PendingPayment
            {
                pending.push(appt.id);
            }
        }
        pending
    }

    pub fn get_customer(&self, id: Ulid) -> Result<Customer, EngineError> {
        self.customers
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Look a customer up by name and email, both of which must match.
    pub fn find_customer(&self, name: &str, email: &str) -> Option<Customer> {
        let id = *self.customer_emails.get(&email_key(email))?.value();
        self.customers
            .get(&id)
            .map(|c| c.value().clone())
            .filter(|c| c.name == name.trim())
    }

    /// Number of appointments whose index entry points at the slot.
    pub fn slot_hold_count(&self, slot_id: Ulid) -> usize {
        self.appointment_to_slot
            .iter()
            .filter(|e| *e.value() == slot_id)
            .count()
    }
}
