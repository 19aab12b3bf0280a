use ulid::Ulid;

/// Coarse classification handed to callers and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    PolicyViolation,
    Unauthorized,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Storage => "storage",
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    /// Slot is held by another appointment.
    SlotUnavailable(Ulid),
    /// Slot cannot be deleted while an appointment holds it.
    SlotInUse(Ulid),
    /// Appointment is not in `Reserved`, so it cannot be confirmed.
    NotReserved(Ulid),
    /// New slot intersects this existing slot.
    Overlap(Ulid),
    OutsideWindow(&'static str),
    InvalidDuration(u32),
    NotOwner(Ulid),
    Unauthorized(&'static str),
    AlreadyExists(&'static str),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::SlotInUse(_)
            | EngineError::NotReserved(_)
            | EngineError::AlreadyExists(_) => ErrorKind::InvalidState,
            EngineError::SlotUnavailable(_)
            | EngineError::Overlap(_)
            | EngineError::OutsideWindow(_)
            | EngineError::InvalidDuration(_)
            | EngineError::NotOwner(_)
            | EngineError::InvalidInput(_)
            | EngineError::LimitExceeded(_) => ErrorKind::PolicyViolation,
            EngineError::Unauthorized(_) => ErrorKind::Unauthorized,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::SlotUnavailable(id) => write!(f, "slot not available: {id}"),
            EngineError::SlotInUse(id) => {
                write!(f, "slot {id} has an appointment, delete the appointment first")
            }
            EngineError::NotReserved(id) => {
                write!(f, "appointment {id} not ready for confirmation")
            }
            EngineError::Overlap(id) => write!(f, "overlaps with slot {id}"),
            EngineError::OutsideWindow(msg) => write!(f, "invalid start time: {msg}"),
            EngineError::InvalidDuration(m) => write!(f, "invalid duration in minutes: {m}"),
            EngineError::NotOwner(id) => {
                write!(f, "appointment {id} belongs to a different customer")
            }
            EngineError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            EngineError::AlreadyExists(what) => write!(f, "{what} already registered"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
