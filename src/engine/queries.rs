use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_guests, validate_range};
use super::pricing::compute_breakdown;
use super::{Engine, EngineError};

impl Engine {
    /// Price a prospective stay without touching the calendar. Settings and
    /// season rules are cloned under the read lock; the arithmetic runs
    /// outside it. The breakdown is not binding until a hold freezes it.
    pub async fn quote(
        &self,
        range: DateRange,
        guests: u32,
        pets: bool,
    ) -> Result<PriceBreakdown, EngineError> {
        validate_range(&range)?;
        let (settings, seasons) = {
            let unit = self.lock_unit_read().await;
            (unit.settings.clone(), unit.seasons.clone())
        };
        validate_guests(guests, &settings)?;
        Ok(compute_breakdown(&range, guests, pets, &settings, &seasons))
    }

    pub async fn settings(&self) -> PricingSettings {
        self.lock_unit_read().await.settings.clone()
    }

    /// Season rules in definition order, inactive ones included.
    pub async fn list_seasons(&self) -> Vec<SeasonRule> {
        let unit = self.lock_unit_read().await;
        let mut seasons = unit.seasons.clone();
        seasons.sort_by_key(|s| s.seq);
        seasons
    }

    /// Live holds. A lapsed hold drops out of this view the moment it
    /// expires, reaped or not, just as it stops blocking new holds.
    pub async fn list_holds(&self) -> Vec<HoldInfo> {
        let now = now_ms();
        let unit = self.lock_unit_read().await;
        unit.entries
            .iter()
            .filter(|e| !e.expired(now))
            .filter_map(|e| match e.kind {
                EntryKind::Hold { expires_at } => Some(HoldInfo {
                    id: e.booking_id,
                    range: e.range,
                    guests: unit.bookings.get(&e.booking_id).map_or(0, |b| b.guests),
                    expires_at,
                }),
                EntryKind::Booked => None,
            })
            .collect()
    }

    /// All bookings in placement order, or just the one when `id` is given.
    /// Cancelled and completed bookings stay listed; only the calendar forgets
    /// them.
    pub async fn list_bookings(&self, id: Option<Ulid>) -> Vec<Booking> {
        let unit = self.lock_unit_read().await;
        match id {
            Some(id) => unit.bookings.get(&id).cloned().into_iter().collect(),
            None => {
                let mut all: Vec<Booking> = unit.bookings.values().cloned().collect();
                all.sort_by_key(|b| (b.created_at, b.id));
                all
            }
        }
    }

    /// Calendar entries lying fully inside the window, in date order.
    /// Lapsed holds awaiting the reaper are omitted.
    pub async fn calendar(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CalendarEntry>, EngineError> {
        if end <= start {
            return Err(EngineError::InvalidRange);
        }
        if (end - start).num_days() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let now = now_ms();
        let unit = self.lock_unit_read().await;
        Ok(unit
            .entries
            .iter()
            .filter(|e| e.range.start >= start && e.range.end <= end && !e.expired(now))
            .copied()
            .collect())
    }

    /// Invoices in number order, optionally narrowed to one document or one
    /// booking's documents.
    pub async fn list_invoices(&self, id: Option<Ulid>, booking_id: Option<Ulid>) -> Vec<Invoice> {
        let ledger = self.lock_ledger().await;
        ledger
            .invoices
            .iter()
            .filter(|i| id.is_none_or(|wanted| i.id == wanted))
            .filter(|i| booking_id.is_none_or(|wanted| i.booking_id == wanted))
            .cloned()
            .collect()
    }
}
