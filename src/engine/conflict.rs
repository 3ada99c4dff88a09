use chrono::Datelike;
use rust_decimal::Decimal;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_range(range: &DateRange) -> Result<(), EngineError> {
    use crate::limits::*;
    if range.end <= range.start {
        return Err(EngineError::InvalidRange);
    }
    if range.start.year() < MIN_STAY_YEAR || range.end.year() > MAX_STAY_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if range.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(())
}

pub(crate) fn validate_guests(guests: u32, settings: &PricingSettings) -> Result<(), EngineError> {
    if guests == 0 || guests > settings.max_guests {
        return Err(EngineError::InvalidGuestCount(guests));
    }
    Ok(())
}

pub(crate) fn validate_contact(contact: &GuestContact) -> Result<(), EngineError> {
    use crate::limits::MAX_CONTACT_FIELD_LEN;
    for field in [&contact.name, &contact.email, &contact.phone] {
        if let Some(s) = field
            && s.len() > MAX_CONTACT_FIELD_LEN
        {
            return Err(EngineError::LimitExceeded("contact field too long"));
        }
    }
    Ok(())
}

pub(crate) fn validate_amount(amount: Decimal) -> Result<(), EngineError> {
    if amount < Decimal::ZERO {
        return Err(EngineError::LimitExceeded("amount must not be negative"));
    }
    Ok(())
}

/// A hold or confirmed stay overlapping the requested dates is a conflict,
/// except holds that have already lapsed. Lapsed holds stop blocking the
/// moment they expire, reaped or not.
pub(crate) fn check_no_conflict(
    unit: &UnitState,
    range: &DateRange,
    now: Ms,
) -> Result<(), EngineError> {
    for entry in unit.overlapping(range) {
        if entry.expired(now) {
            continue;
        }
        return Err(EngineError::Unavailable {
            conflict_with: entry.booking_id,
        });
    }
    Ok(())
}
