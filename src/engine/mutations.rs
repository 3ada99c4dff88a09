use rust_decimal::Decimal;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_no_conflict, now_ms, validate_amount, validate_contact, validate_guests, validate_range,
};
use super::{Engine, EngineError, WalCommand, pricing};

impl Engine {
    // ── Settings & seasons ────────────────────────────────

    /// Apply a partial settings update. The WAL records the full resulting
    /// settings, so replay never depends on patch ordering.
    pub async fn update_settings(
        &self,
        changes: Vec<SettingsChange>,
    ) -> Result<PricingSettings, EngineError> {
        let mut unit = self.lock_unit_write().await?;
        let mut settings = unit.settings.clone();
        for change in changes {
            match change {
                SettingsChange::DefaultNightlyRate(v) => {
                    validate_amount(v)?;
                    settings.default_nightly_rate = v;
                }
                SettingsChange::CleaningFee(v) => {
                    validate_amount(v)?;
                    settings.cleaning_fee = v;
                }
                SettingsChange::PetCleaningFee(v) => {
                    validate_amount(v)?;
                    settings.pet_cleaning_fee = v;
                }
                SettingsChange::ExtraGuestFee(v) => {
                    validate_amount(v)?;
                    settings.extra_guest_fee = v;
                }
                SettingsChange::ExtraGuestThreshold(v) => {
                    settings.extra_guest_threshold = v;
                }
                SettingsChange::TouristTax(v) => {
                    validate_amount(v)?;
                    settings.tourist_tax = v;
                }
                SettingsChange::TaxCapNights(v) => {
                    settings.tax_cap_nights = v;
                }
                SettingsChange::MaxGuests(v) => {
                    if v == 0 {
                        return Err(EngineError::LimitExceeded("max_guests must be at least 1"));
                    }
                    settings.max_guests = v;
                }
            }
        }

        let event = Event::SettingsUpdated {
            settings: settings.clone(),
        };
        self.persist_and_apply(&mut unit, &event).await?;
        Ok(settings)
    }

    pub async fn add_season(
        &self,
        id: Ulid,
        name: Option<String>,
        range: DateRange,
        nightly_rate: Decimal,
        active: bool,
    ) -> Result<(), EngineError> {
        validate_range(&range)?;
        validate_season_rate(nightly_rate)?;
        validate_season_name(&name)?;

        let mut unit = self.lock_unit_write().await?;
        if unit.seasons.len() >= MAX_SEASONS {
            return Err(EngineError::LimitExceeded("too many season rules"));
        }
        if unit.seasons.iter().any(|s| s.id == id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let rule = SeasonRule {
            id,
            name,
            range,
            nightly_rate,
            active,
            seq: unit.season_seq,
        };
        let event = Event::SeasonAdded { rule };
        self.persist_and_apply(&mut unit, &event).await
    }

    /// Apply a partial season update. The edited rule is re-sequenced as the
    /// most recently defined, so it wins equal-length ties from now on.
    pub async fn update_season(&self, id: Ulid, patch: SeasonPatch) -> Result<(), EngineError> {
        let mut unit = self.lock_unit_write().await?;
        let current = unit
            .seasons
            .iter()
            .find(|s| s.id == id)
            .ok_or(EngineError::NotFound(id))?;

        let mut rule = current.clone();
        if let Some(name) = patch.name {
            rule.name = name;
        }
        if let Some(start) = patch.start {
            rule.range.start = start;
        }
        if let Some(end) = patch.end {
            rule.range.end = end;
        }
        if let Some(rate) = patch.nightly_rate {
            rule.nightly_rate = rate;
        }
        if let Some(active) = patch.active {
            rule.active = active;
        }
        validate_range(&rule.range)?;
        validate_season_rate(rule.nightly_rate)?;
        validate_season_name(&rule.name)?;
        rule.seq = unit.season_seq;

        let event = Event::SeasonUpdated { rule };
        self.persist_and_apply(&mut unit, &event).await
    }

    pub async fn remove_season(&self, id: Ulid) -> Result<(), EngineError> {
        let mut unit = self.lock_unit_write().await?;
        if !unit.seasons.iter().any(|s| s.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::SeasonRemoved { id };
        self.persist_and_apply(&mut unit, &event).await
    }

    // ── Holds ─────────────────────────────────────────────

    /// Atomic check-then-reserve. The conflict check and the calendar insert
    /// happen under one write lock; two racing holds for the same dates can
    /// never both pass. The price is computed here, against the settings and
    /// seasons in effect right now, and frozen into the booking.
    pub async fn try_hold(
        &self,
        id: Ulid,
        range: DateRange,
        guests: u32,
        pets: bool,
        contact: GuestContact,
    ) -> Result<Booking, EngineError> {
        validate_range(&range)?;
        validate_contact(&contact)?;

        let mut unit = self.lock_unit_write().await?;
        validate_guests(guests, &unit.settings)?;
        if unit.entries.len() >= MAX_CALENDAR_ENTRIES {
            return Err(EngineError::LimitExceeded("calendar full"));
        }
        if unit.bookings.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let now = now_ms();
        check_no_conflict(&unit, &range, now)?;

        let breakdown =
            pricing::compute_breakdown(&range, guests, pets, &unit.settings, &unit.seasons);
        let expires_at = now + self.hold_ttl_ms;
        let booking = Booking {
            id,
            range,
            guests,
            pets,
            contact,
            status: BookingStatus::Held,
            breakdown,
            created_at: now,
        };

        let event = Event::HoldPlaced {
            id,
            range,
            guests,
            pets,
            contact: booking.contact.clone(),
            breakdown: booking.breakdown.clone(),
            expires_at,
            created_at: now,
        };
        self.persist_and_apply(&mut unit, &event).await?;
        Ok(booking)
    }

    /// Explicit release of a pending hold. Releasing a hold that is already
    /// cancelled is a no-op (`Ok(false)`), so a guest cancel racing the
    /// expiry reaper stays harmless.
    pub async fn release_hold(&self, id: Ulid) -> Result<bool, EngineError> {
        let mut unit = self.lock_unit_write().await?;
        let status = unit
            .bookings
            .get(&id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(id))?;
        match status {
            BookingStatus::Held => {
                let event = Event::HoldReleased { id, expired: false };
                self.persist_and_apply(&mut unit, &event).await?;
                Ok(true)
            }
            BookingStatus::Cancelled => Ok(false),
            other => Err(EngineError::InvalidTransition {
                from: other,
                to: BookingStatus::Cancelled,
            }),
        }
    }

    /// Reaper-side release. Re-checks expiry under the lock: a hold that was
    /// confirmed or released after being collected is left alone.
    pub async fn reap_expired_hold(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let mut unit = self.lock_unit_write().await?;
        let still_held = unit
            .bookings
            .get(&id)
            .is_some_and(|b| b.status == BookingStatus::Held);
        let lapsed = unit.entry(id).is_some_and(|e| e.expired(now));
        if !still_held || !lapsed {
            return Ok(false);
        }
        let event = Event::HoldReleased { id, expired: true };
        self.persist_and_apply(&mut unit, &event).await?;
        Ok(true)
    }

    // ── Booking lifecycle ─────────────────────────────────

    /// Payment confirmed: held → confirmed. The hold must still be alive;
    /// a payment landing after expiry is surfaced as `HoldExpired` for the
    /// caller to refund out of band.
    pub async fn confirm_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let mut unit = self.lock_unit_write().await?;
        let status = unit
            .bookings
            .get(&id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(id))?;
        match status {
            BookingStatus::Held => {
                if unit.entry(id).is_some_and(|e| e.expired(now_ms())) {
                    return Err(EngineError::HoldExpired(id));
                }
                let event = Event::BookingConfirmed { id };
                self.persist_and_apply(&mut unit, &event).await
            }
            other => Err(EngineError::InvalidTransition {
                from: other,
                to: BookingStatus::Confirmed,
            }),
        }
    }

    pub async fn check_in(&self, id: Ulid) -> Result<(), EngineError> {
        let mut unit = self.lock_unit_write().await?;
        let status = unit
            .bookings
            .get(&id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(id))?;
        match status {
            BookingStatus::Confirmed => {
                let event = Event::BookingCheckedIn { id };
                self.persist_and_apply(&mut unit, &event).await
            }
            other => Err(EngineError::InvalidTransition {
                from: other,
                to: BookingStatus::CheckedIn,
            }),
        }
    }

    pub async fn complete(&self, id: Ulid) -> Result<(), EngineError> {
        let mut unit = self.lock_unit_write().await?;
        let status = unit
            .bookings
            .get(&id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(id))?;
        match status {
            BookingStatus::CheckedIn => {
                let event = Event::BookingCompleted { id };
                self.persist_and_apply(&mut unit, &event).await
            }
            other => Err(EngineError::InvalidTransition {
                from: other,
                to: BookingStatus::Completed,
            }),
        }
    }

    /// Cancel from any non-terminal state, freeing the dates. Cancelling an
    /// already-cancelled booking is a no-op; a completed stay cannot be
    /// cancelled.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<bool, EngineError> {
        let mut unit = self.lock_unit_write().await?;
        let status = unit
            .bookings
            .get(&id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(id))?;
        match status {
            BookingStatus::Held => {
                let event = Event::HoldReleased { id, expired: false };
                self.persist_and_apply(&mut unit, &event).await?;
                Ok(true)
            }
            BookingStatus::Confirmed | BookingStatus::CheckedIn => {
                let event = Event::BookingCancelled { id };
                self.persist_and_apply(&mut unit, &event).await?;
                Ok(true)
            }
            BookingStatus::Cancelled => Ok(false),
            BookingStatus::Completed => Err(EngineError::InvalidTransition {
                from: BookingStatus::Completed,
                to: BookingStatus::Cancelled,
            }),
        }
    }

    /// Route a `status = '...'` assignment to the matching transition.
    /// Returns whether a row actually changed.
    pub async fn transition_booking(
        &self,
        id: Ulid,
        to: BookingStatus,
    ) -> Result<bool, EngineError> {
        match to {
            BookingStatus::Confirmed => self.confirm_booking(id).await.map(|()| true),
            BookingStatus::CheckedIn => self.check_in(id).await.map(|()| true),
            BookingStatus::Completed => self.complete(id).await.map(|()| true),
            BookingStatus::Cancelled => self.cancel_booking(id).await,
            BookingStatus::Held => {
                let from = {
                    let unit = self.lock_unit_read().await;
                    unit.bookings
                        .get(&id)
                        .map(|b| b.status)
                        .ok_or(EngineError::NotFound(id))?
                };
                Err(EngineError::InvalidTransition { from, to })
            }
        }
    }

    // ── Reaper & compaction ───────────────────────────────

    /// Snapshot of lapsed holds. Uses try_read so the reaper never queues
    /// behind writers; a missed tick catches them next time.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<Ulid> {
        let Ok(unit) = self.unit.try_read() else {
            return Vec::new();
        };
        unit.entries
            .iter()
            .filter(|e| e.expired(now))
            .map(|e| e.booking_id)
            .collect()
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Both locks are held until the swap
    /// completes so no mutation can slip between snapshot and rewrite.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let unit = self.lock_unit_read().await;
        let ledger = self.lock_ledger().await;

        let mut events = Vec::new();
        events.push(Event::SettingsUpdated {
            settings: unit.settings.clone(),
        });

        let mut seasons: Vec<&SeasonRule> = unit.seasons.iter().collect();
        seasons.sort_by_key(|s| s.seq);
        for rule in seasons {
            events.push(Event::SeasonAdded { rule: rule.clone() });
        }

        let mut bookings: Vec<&Booking> = unit.bookings.values().collect();
        bookings.sort_by_key(|b| (b.created_at, b.id));
        for b in bookings {
            // Live holds keep their real expiry; for later states the value
            // never matters because a lifecycle event follows immediately.
            let expires_at = match unit.entry(b.id).map(|e| e.kind) {
                Some(EntryKind::Hold { expires_at }) => expires_at,
                _ => b.created_at,
            };
            events.push(Event::HoldPlaced {
                id: b.id,
                range: b.range,
                guests: b.guests,
                pets: b.pets,
                contact: b.contact.clone(),
                breakdown: b.breakdown.clone(),
                expires_at,
                created_at: b.created_at,
            });
            match b.status {
                BookingStatus::Held => {}
                BookingStatus::Confirmed => {
                    events.push(Event::BookingConfirmed { id: b.id });
                }
                BookingStatus::CheckedIn => {
                    events.push(Event::BookingConfirmed { id: b.id });
                    events.push(Event::BookingCheckedIn { id: b.id });
                }
                BookingStatus::Completed => {
                    events.push(Event::BookingCompleted { id: b.id });
                }
                BookingStatus::Cancelled => {
                    events.push(Event::HoldReleased {
                        id: b.id,
                        expired: false,
                    });
                }
            }
        }

        // Invoices embed their current status, so one event each suffices.
        for invoice in &ledger.invoices {
            events.push(Event::InvoiceIssued {
                invoice: invoice.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn validate_season_rate(rate: Decimal) -> Result<(), EngineError> {
    if rate <= Decimal::ZERO {
        return Err(EngineError::LimitExceeded("nightly_rate must be positive"));
    }
    Ok(())
}

fn validate_season_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_SEASON_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("season name too long"));
    }
    Ok(())
}
