use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::info;
use ulid::Ulid;

use crate::model::{AppointmentStatus, SlotInfo};

const CHANNEL_CAPACITY: usize = 256;

/// Status carried by a lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifiedStatus {
    PendingPayment,
    Reserved,
    Confirmed,
    Cancelled,
}

impl From<AppointmentStatus> for NotifiedStatus {
    fn from(status: AppointmentStatus) -> Self {
        match status {
            AppointmentStatus::PendingPayment => NotifiedStatus::PendingPayment,
            AppointmentStatus::Reserved => NotifiedStatus::Reserved,
            AppointmentStatus::Confirmed => NotifiedStatus::Confirmed,
        }
    }
}

impl NotifiedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifiedStatus::PendingPayment => "PENDING_PAYMENT",
            NotifiedStatus::Reserved => "RESERVED",
            NotifiedStatus::Confirmed => "CONFIRMED",
            NotifiedStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub appointment_id: Ulid,
    pub customer_id: Ulid,
    pub slot: SlotInfo,
    pub status: NotifiedStatus,
}

/// Broadcast hub for appointment lifecycle notifications, one channel for
/// everything plus one per customer. Delivery is fire-and-forget.
pub struct NotifyHub {
    all: broadcast::Sender<Notification>,
    customers: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            customers: DashMap::new(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// Subscribe to one customer's notifications. Creates the channel if needed.
    pub fn subscribe(&self, customer_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .customers
            .entry(customer_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, notification: Notification) {
        info!(
            "appointment {} on slot starting {} has a new status: {}",
            notification.appointment_id,
            notification.slot.start,
            notification.status.as_str()
        );
        if let Some(sender) = self.customers.get(&notification.customer_id) {
            let _ = sender.send(notification.clone());
        }
        let _ = self.all.send(notification);
    }

    /// Drop a customer's channel once nobody is subscribed to it.
    pub fn prune(&self) {
        self.customers.retain(|_, tx| tx.receiver_count() > 0);
    }
}
