use rust_decimal::Decimal;
use ulid::Ulid;

use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// Issue the invoice (or receipt) for a booking. The number is assigned
    /// under the ledger lock, so numbers stay unique and strictly increasing
    /// even under parallel issuance. Only bookings at confirmed or later can
    /// be invoiced, and a booking carries at most one non-cancelled document;
    /// corrections go through cancel + reissue.
    pub async fn issue_invoice(
        &self,
        id: Ulid,
        booking_id: Ulid,
        kind: InvoiceKind,
    ) -> Result<Invoice, EngineError> {
        // Snapshot the booking first; the calendar lock is never held while
        // numbering, and vice versa.
        let booking = {
            let unit = self.lock_unit_read().await;
            unit.bookings
                .get(&booking_id)
                .cloned()
                .ok_or(EngineError::NotFound(booking_id))?
        };
        match booking.status {
            BookingStatus::Confirmed | BookingStatus::CheckedIn | BookingStatus::Completed => {}
            _ => return Err(EngineError::BookingNotConfirmed(booking_id)),
        }

        let mut ledger = self.lock_ledger().await;
        if ledger.find(id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if ledger.open_for_booking(booking_id).is_some() {
            return Err(EngineError::AlreadyIssued(booking_id));
        }

        let invoice = Invoice {
            id,
            number: ledger.next_number,
            kind,
            status: InvoiceStatus::Issued,
            booking_id,
            lines: line_items(&booking),
            total_amount: booking.breakdown.total,
            issued_at: now_ms(),
        };
        let event = Event::InvoiceIssued {
            invoice: invoice.clone(),
        };
        self.persist_and_apply_ledger(&mut ledger, &event).await?;
        Ok(invoice)
    }

    /// Move an invoice's status. The document content never changes.
    pub async fn set_invoice_status(
        &self,
        id: Ulid,
        to: InvoiceStatus,
    ) -> Result<(), EngineError> {
        let mut ledger = self.lock_ledger().await;
        let from = ledger
            .find(id)
            .map(|i| i.status)
            .ok_or(EngineError::NotFound(id))?;
        if !from.can_become(to) {
            return Err(EngineError::InvalidInvoiceTransition { from, to });
        }
        let event = Event::InvoiceStatusChanged { id, status: to };
        self.persist_and_apply_ledger(&mut ledger, &event).await
    }
}

/// Derive line items from the booking's frozen breakdown: one accommodation
/// line plus one line per non-zero fee category. Line totals are the exact
/// component values; only the document total carries the rounding.
fn line_items(booking: &Booking) -> Vec<LineItem> {
    let b = &booking.breakdown;
    let nights = b.nights;
    let mut lines = vec![LineItem {
        description: format!(
            "Accommodation ({nights} night{})",
            if nights == 1 { "" } else { "s" }
        ),
        quantity: Decimal::ONE,
        unit_price: b.accommodation_total,
        tax_rate: Decimal::ZERO,
        total: b.accommodation_total,
    }];
    if b.cleaning_fee > Decimal::ZERO {
        lines.push(LineItem {
            description: if booking.pets {
                "Cleaning fee (incl. pet surcharge)".to_string()
            } else {
                "Cleaning fee".to_string()
            },
            quantity: Decimal::ONE,
            unit_price: b.cleaning_fee,
            tax_rate: Decimal::ZERO,
            total: b.cleaning_fee,
        });
    }
    if b.extra_guest_fee_total > Decimal::ZERO {
        lines.push(LineItem {
            description: "Extra guest fee".to_string(),
            quantity: Decimal::ONE,
            unit_price: b.extra_guest_fee_total,
            tax_rate: Decimal::ZERO,
            total: b.extra_guest_fee_total,
        });
    }
    if b.tourist_tax_total > Decimal::ZERO {
        lines.push(LineItem {
            description: "Tourist tax".to_string(),
            quantity: Decimal::ONE,
            unit_price: b.tourist_tax_total,
            tax_rate: Decimal::ZERO,
            total: b.tourist_tax_total,
        });
    }
    lines
}
