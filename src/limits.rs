use std::time::Duration;

use crate::model::{Secs, DAY};

pub const MAX_SLOTS: usize = 100_000;
pub const MAX_CUSTOMERS: usize = 1_000_000;
pub const MIN_NAME_LEN: usize = 2;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP: Secs = 946_684_800;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP: Secs = 4_102_444_800;

/// Longest line accepted from the payment feed.
pub const MAX_FEED_LINE_LEN: usize = 16 * 1024;

/// Upper bound for the lead time, cancellation cutoff and horizon.
pub const MAX_POLICY_WINDOW: Secs = 10 * 366 * DAY;

/// Longest a booking may wait for payment.
pub const MAX_PAYMENT_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);
