use crate::config::BookingPolicy;
use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_timestamp(t: Secs) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP..=MAX_VALID_TIMESTAMP).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Span for a new slot, or why it cannot be created.
pub(crate) fn new_slot_span(
    policy: &BookingPolicy,
    start: Secs,
    duration_minutes: u32,
    now: Secs,
) -> Result<Span, EngineError> {
    validate_timestamp(start)?;
    if duration_minutes == 0 || duration_minutes > policy.max_slot_minutes {
        return Err(EngineError::InvalidDuration(duration_minutes));
    }
    if start <= now {
        return Err(EngineError::OutsideWindow("slot starts in the past"));
    }
    if start > now.saturating_add(policy.horizon) {
        return Err(EngineError::OutsideWindow("slot starts beyond the booking horizon"));
    }
    Ok(Span::new(start, start + duration_minutes as Secs * MINUTE))
}

/// A slot may be booked only when it starts strictly later than the lead
/// time from now and no later than the horizon.
pub(crate) fn check_bookable(policy: &BookingPolicy, span: &Span, now: Secs) -> Result<(), EngineError> {
    if span.start <= now.saturating_add(policy.lead_time) {
        return Err(EngineError::OutsideWindow("slot starts inside the booking lead time"));
    }
    if span.start > now.saturating_add(policy.horizon) {
        return Err(EngineError::OutsideWindow("slot starts beyond the booking horizon"));
    }
    Ok(())
}

pub(crate) fn check_cancellable(policy: &BookingPolicy, span: &Span, now: Secs) -> Result<(), EngineError> {
    if span.start <= now.saturating_add(policy.cancel_cutoff) {
        return Err(EngineError::OutsideWindow("slot starts inside the cancellation cutoff"));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    let len = name.chars().count();
    if len < MIN_NAME_LEN {
        return Err(EngineError::InvalidInput("invalid name"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

/// Structural check only: one `@`, non-empty local part, dotted domain with
/// non-empty labels, no whitespace.
pub(crate) fn validate_email(email: &str) -> Result<(), EngineError> {
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email address too long"));
    }
    let invalid = EngineError::InvalidInput("invalid email address");
    if email.chars().any(char::is_whitespace) {
        return Err(invalid);
    }
    let Some((local, domain)) = email.split_once('@') else {
        return Err(invalid);
    };
    if local.is_empty() || domain.contains('@') || !domain.contains('.') {
        return Err(invalid);
    }
    if domain.split('.').any(str::is_empty) {
        return Err(invalid);
    }
    Ok(())
}
