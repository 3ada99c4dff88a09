use ulid::Ulid;

use crate::model::{BookingStatus, InvoiceStatus};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Check-out not after check-in.
    InvalidRange,
    InvalidGuestCount(u32),
    /// The requested dates collide with an existing hold or booking.
    Unavailable { conflict_with: Ulid },
    /// Could not take the calendar write lock in time.
    Contention,
    /// Payment arrived after the hold lapsed.
    HoldExpired(Ulid),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    InvalidInvoiceTransition {
        from: InvoiceStatus,
        to: InvoiceStatus,
    },
    /// The booking already has a non-cancelled invoice.
    AlreadyIssued(Ulid),
    /// Invoices are only issued for confirmed or later bookings.
    BookingNotConfirmed(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidRange => {
                write!(f, "invalid range: check_out must be after check_in")
            }
            EngineError::InvalidGuestCount(n) => write!(f, "invalid guest count: {n}"),
            EngineError::Unavailable { conflict_with } => {
                write!(f, "dates unavailable: conflict with booking {conflict_with}")
            }
            EngineError::Contention => {
                write!(f, "dates unavailable: calendar busy, try again")
            }
            EngineError::HoldExpired(id) => write!(f, "hold expired: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(
                    f,
                    "invalid transition: {} -> {}",
                    from.as_str(),
                    to.as_str()
                )
            }
            EngineError::InvalidInvoiceTransition { from, to } => {
                write!(
                    f,
                    "invalid invoice transition: {} -> {}",
                    from.as_str(),
                    to.as_str()
                )
            }
            EngineError::AlreadyIssued(booking_id) => {
                write!(f, "invoice already issued for booking {booking_id}")
            }
            EngineError::BookingNotConfirmed(booking_id) => {
                write!(f, "booking {booking_id} is not confirmed")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
