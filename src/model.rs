use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix seconds, used for every timestamp.
pub type Secs = i64;

pub const MINUTE: Secs = 60;
pub const HOUR: Secs = 60 * MINUTE;
pub const DAY: Secs = 24 * HOUR;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Secs,
    pub end: Secs,
}

impl Span {
    pub fn new(start: Secs, end: Secs) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_secs(&self) -> Secs {
        self.end - self.start
    }

    pub fn duration_minutes(&self) -> u32 {
        (self.duration_secs() / MINUTE) as u32
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Payment-gated lifecycle of an appointment. Cancellation deletes the row,
/// so there is no cancelled status here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    PendingPayment,
    Reserved,
    Confirmed,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 3] = [
        AppointmentStatus::PendingPayment,
        AppointmentStatus::Reserved,
        AppointmentStatus::Confirmed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::PendingPayment => "PENDING_PAYMENT",
            AppointmentStatus::Reserved => "RESERVED",
            AppointmentStatus::Confirmed => "CONFIRMED",
        }
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a payment confirmation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentSource {
    Feed,
    Webhook,
}

/// What we know about the payment that moved an appointment to `Reserved`.
/// Webhook confirmations carry neither payer nor amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub source: PaymentSource,
    pub payer: Option<String>,
    pub amount: Option<u128>,
}

impl PaymentReceipt {
    pub fn webhook() -> Self {
        Self {
            source: PaymentSource::Webhook,
            payer: None,
            amount: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalReason {
    /// Payment window elapsed while still pending.
    Expired,
    CancelledByCustomer,
    DeletedByAdmin,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalReason::Expired => "expired",
            RemovalReason::CancelledByCustomer => "cancelled_by_customer",
            RemovalReason::DeletedByAdmin => "deleted_by_admin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Customer {
    pub id: Ulid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub id: Ulid,
    pub span: Span,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appointment {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub customer_id: Ulid,
    pub status: AppointmentStatus,
    pub created_at: Secs,
    pub receipt: Option<PaymentReceipt>,
}

/// A slot row together with the appointment holding it, if any.
/// Keeping the hold inside the slot makes "at most one appointment per slot"
/// structural; `slot.available` mirrors `appointment.is_none()`.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot: Slot,
    pub appointment: Option<Appointment>,
}

impl SlotState {
    pub fn new(id: Ulid, span: Span) -> Self {
        Self {
            slot: Slot {
                id,
                span,
                available: true,
            },
            appointment: None,
        }
    }

    pub fn hold(&mut self, appointment: Appointment) {
        self.slot.available = false;
        self.appointment = Some(appointment);
    }

    pub fn release(&mut self) -> Option<Appointment> {
        self.slot.available = true;
        self.appointment.take()
    }

    /// Appointment on this slot, if it has the given id.
    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointment.as_mut().filter(|a| a.id == id)
    }

    pub fn is_consistent(&self) -> bool {
        self.slot.available == self.appointment.is_none()
    }
}

/// Index of all slot spans, sorted by start, used for overlap checks and
/// ordered listings.
#[derive(Debug, Default)]
pub struct Calendar {
    entries: Vec<(Span, Ulid)>,
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, span: Span, id: Ulid) {
        let pos = self
            .entries
            .binary_search_by_key(&span.start, |(s, _)| s.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, (span, id));
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Span> {
        let pos = self.entries.iter().position(|(_, sid)| *sid == id)?;
        Some(self.entries.remove(pos).0)
    }

    /// Entries whose span overlaps the query.
    /// Uses binary search to skip entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &(Span, Ulid)> {
        let right_bound = self.entries.partition_point(|(s, _)| s.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |(s, _)| s.end > query.start)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Span, Ulid)> {
        self.entries.iter()
    }
}

/// WAL record format. Every state change is one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CustomerRegistered {
        id: Ulid,
        name: String,
        email: String,
    },
    SlotCreated {
        id: Ulid,
        span: Span,
    },
    SlotDeleted {
        id: Ulid,
    },
    AppointmentCreated {
        id: Ulid,
        slot_id: Ulid,
        customer_id: Ulid,
        created_at: Secs,
    },
    AppointmentPaid {
        id: Ulid,
        slot_id: Ulid,
        receipt: PaymentReceipt,
    },
    AppointmentConfirmed {
        id: Ulid,
        slot_id: Ulid,
    },
    AppointmentRemoved {
        id: Ulid,
        slot_id: Ulid,
        reason: RemovalReason,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub start: Secs,
    pub end: Secs,
    pub duration_minutes: u32,
    pub available: bool,
}

impl From<&Slot> for SlotInfo {
    fn from(slot: &Slot) -> Self {
        Self {
            id: slot.id,
            start: slot.span.start,
            end: slot.span.end,
            duration_minutes: slot.span.duration_minutes(),
            available: slot.available,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentInfo {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub status: AppointmentStatus,
    pub created_at: Secs,
    pub receipt: Option<PaymentReceipt>,
    pub slot: SlotInfo,
}

impl AppointmentInfo {
    pub fn new(appointment: &Appointment, slot: &Slot) -> Self {
        Self {
            id: appointment.id,
            customer_id: appointment.customer_id,
            status: appointment.status,
            created_at: appointment.created_at,
            receipt: appointment.receipt.clone(),
            slot: SlotInfo::from(slot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_overlap() {
        let a = Span::new(10 * HOUR, 10 * HOUR + 30 * MINUTE);
        let b = Span::new(10 * HOUR + 15 * MINUTE, 10 * HOUR + 45 * MINUTE);
        let c = Span::new(10 * HOUR + 30 * MINUTE, 11 * HOUR);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_duration_minutes() {
        assert_eq!(Span::new(0, 30 * MINUTE).duration_minutes(), 30);
        assert_eq!(Span::new(0, HOUR).duration_minutes(), 60);
    }

    #[test]
    fn slot_state_hold_and_release() {
        let mut st = SlotState::new(Ulid::new(), Span::new(0, 30 * MINUTE));
        assert!(st.slot.available);
        assert!(st.is_consistent());

        let appt = Appointment {
            id: Ulid::new(),
            slot_id: st.slot.id,
            customer_id: Ulid::new(),
            status: AppointmentStatus::PendingPayment,
            created_at: 0,
            receipt: None,
        };
        st.hold(appt.clone());
        assert!(!st.slot.available);
        assert!(st.is_consistent());
        assert!(st.appointment_mut(appt.id).is_some());
        assert!(st.appointment_mut(Ulid::new()).is_none());

        let released = st.release().unwrap();
        assert_eq!(released.id, appt.id);
        assert!(st.slot.available);
        assert!(st.is_consistent());
    }

    #[test]
    fn calendar_ordering() {
        let mut cal = Calendar::new();
        let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        cal.insert(Span::new(300, 400), ids[2]);
        cal.insert(Span::new(100, 200), ids[0]);
        cal.insert(Span::new(200, 300), ids[1]);
        let order: Vec<Ulid> = cal.iter().map(|(_, id)| *id).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn calendar_overlapping_half_open() {
        let mut cal = Calendar::new();
        cal.insert(Span::new(100, 200), Ulid::new());
        cal.insert(Span::new(450, 600), Ulid::new());
        cal.insert(Span::new(1000, 1100), Ulid::new());

        let hits: Vec<_> = cal.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, Span::new(450, 600));

        // Ending exactly at query.start is not an overlap
        assert_eq!(cal.overlapping(&Span::new(200, 300)).count(), 0);
        // Spanning the whole query is
        assert_eq!(cal.overlapping(&Span::new(120, 150)).count(), 1);
    }

    #[test]
    fn calendar_remove() {
        let mut cal = Calendar::new();
        let id = Ulid::new();
        cal.insert(Span::new(100, 200), id);
        assert_eq!(cal.remove(Ulid::new()), None);
        assert_eq!(cal.remove(id), Some(Span::new(100, 200)));
        assert!(cal.is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentPaid {
            id: Ulid::new(),
            slot_id: Ulid::new(),
            receipt: PaymentReceipt {
                source: PaymentSource::Feed,
                payer: Some("0x00000000000000000000000000000000000000aa".into()),
                amount: Some(100),
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
