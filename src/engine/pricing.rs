use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::model::*;

// ── Rate Resolution ───────────────────────────────────────────────

/// Nightly rate for a single date. Active rules covering the date compete:
/// the shortest range wins, and among equal lengths the highest `seq`
/// (most recently defined) wins. With no covering rule the default applies.
pub fn rate_for_night(date: NaiveDate, seasons: &[SeasonRule], default_rate: Decimal) -> Decimal {
    let mut winner: Option<&SeasonRule> = None;
    for rule in seasons {
        if !rule.active || !rule.range.contains_date(date) {
            continue;
        }
        let better = match winner {
            None => true,
            Some(current) => {
                let (rn, cn) = (rule.range.nights(), current.range.nights());
                rn < cn || (rn == cn && rule.seq > current.seq)
            }
        };
        if better {
            winner = Some(rule);
        }
    }
    winner.map_or(default_rate, |r| r.nightly_rate)
}

/// Price a stay against a settings/seasons snapshot. Pure function of its
/// inputs: same stay against the same snapshot always yields the same
/// breakdown, and nothing here looks at the calendar.
///
/// Components keep their exact values. Only the grand total is rounded,
/// half-up to two decimals, so per-component rounding can never change it.
pub fn compute_breakdown(
    range: &DateRange,
    guests: u32,
    pets: bool,
    settings: &PricingSettings,
    seasons: &[SeasonRule],
) -> PriceBreakdown {
    let nights = range.nights() as u32;

    let mut accommodation_total = Decimal::ZERO;
    for night in range.iter_nights() {
        accommodation_total += rate_for_night(night, seasons, settings.default_nightly_rate);
    }

    let mut cleaning_fee = settings.cleaning_fee;
    if pets {
        cleaning_fee += settings.pet_cleaning_fee;
    }

    let extra_guests = guests.saturating_sub(settings.extra_guest_threshold);
    let extra_guest_fee_total =
        settings.extra_guest_fee * Decimal::from(extra_guests) * Decimal::from(nights);

    let taxed_nights = match settings.tax_cap_nights {
        Some(cap) => nights.min(cap),
        None => nights,
    };
    let tourist_tax_total =
        settings.tourist_tax * Decimal::from(guests) * Decimal::from(taxed_nights);

    let total = (accommodation_total + cleaning_fee + extra_guest_fee_total + tourist_tax_total)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

    PriceBreakdown {
        nights,
        accommodation_total,
        cleaning_fee,
        extra_guest_fee_total,
        tourist_tax_total,
        total,
    }
}
