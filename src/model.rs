use std::collections::HashMap;

use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Used for wall-clock instants: hold expiry, timestamps.
pub type Ms = i64;

/// Half-open date range `[start, end)`: the check-in day through the night
/// before check-out. A guest leaving on the 5th frees the 5th for the next
/// guest's check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "DateRange start must be before end");
        Self { start, end }
    }

    /// Number of occupied nights.
    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True if `date` is one of the occupied nights.
    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    /// Iterate the occupied nights in order, check-in day first.
    pub fn iter_nights(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        (0..self.nights()).map(move |i| self.start + Days::new(i as u64))
    }
}

/// What a calendar entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Tentative reservation awaiting payment confirmation.
    Hold { expires_at: Ms },
    /// Paid, confirmed stay.
    Booked,
}

/// A single entry on the unit calendar. Holds and confirmed stays block
/// dates the same way; only expiry treats them differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEntry {
    pub booking_id: Ulid,
    pub range: DateRange,
    pub kind: EntryKind,
}

impl CalendarEntry {
    pub fn is_hold(&self) -> bool {
        matches!(self.kind, EntryKind::Hold { .. })
    }

    /// True for a hold whose expiry has passed. Confirmed stays never expire.
    pub fn expired(&self, now: Ms) -> bool {
        match self.kind {
            EntryKind::Hold { expires_at } => expires_at <= now,
            EntryKind::Booked => false,
        }
    }
}

/// Per-unit pricing knobs. A single logical row, updated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingSettings {
    /// Nightly rate when no seasonal rule covers the night.
    pub default_nightly_rate: Decimal,
    pub cleaning_fee: Decimal,
    /// Added to the cleaning fee when the stay brings pets.
    pub pet_cleaning_fee: Decimal,
    /// Per guest per night, for each guest beyond `extra_guest_threshold`.
    pub extra_guest_fee: Decimal,
    pub extra_guest_threshold: u32,
    /// Tourist tax per person per night.
    pub tourist_tax: Decimal,
    /// When set, tourist tax stops accruing after this many nights.
    pub tax_cap_nights: Option<u32>,
    pub max_guests: u32,
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            default_nightly_rate: Decimal::ZERO,
            cleaning_fee: Decimal::ZERO,
            pet_cleaning_fee: Decimal::ZERO,
            extra_guest_fee: Decimal::ZERO,
            extra_guest_threshold: 2,
            tourist_tax: Decimal::ZERO,
            tax_cap_nights: None,
            max_guests: 6,
        }
    }
}

/// A seasonal nightly rate over a date range. When several active rules
/// cover the same night, the shortest range wins; among equal lengths the
/// most recently defined rule (highest `seq`) wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonRule {
    pub id: Ulid,
    pub name: Option<String>,
    pub range: DateRange,
    pub nightly_rate: Decimal,
    pub active: bool,
    /// Definition order. Updating a rule re-sequences it as most recent.
    pub seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestContact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Booking lifecycle. The only legal moves are
/// held → confirmed → checked_in → completed, plus cancellation from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Held,
    Confirmed,
    CheckedIn,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Held => "held",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::CheckedIn => "checked_in",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "held" => Some(BookingStatus::Held),
            "confirmed" => Some(BookingStatus::Confirmed),
            "checked_in" => Some(BookingStatus::CheckedIn),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }
}

/// The arithmetic behind a quoted price. Components carry their exact
/// values; only `total` is rounded (half-up, two decimals).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub nights: u32,
    pub accommodation_total: Decimal,
    /// Includes the pet surcharge when the stay brings pets.
    pub cleaning_fee: Decimal,
    pub extra_guest_fee_total: Decimal,
    pub tourist_tax_total: Decimal,
    pub total: Decimal,
}

/// One reservation, from hold through checkout. The breakdown is frozen
/// when the hold is placed; later settings or season edits never reprice it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub range: DateRange,
    pub guests: u32,
    pub pets: bool,
    pub contact: GuestContact,
    pub status: BookingStatus,
    pub breakdown: PriceBreakdown,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceKind {
    Invoice,
    Receipt,
}

impl InvoiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceKind::Invoice => "invoice",
            InvoiceKind::Receipt => "receipt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invoice" => Some(InvoiceKind::Invoice),
            "receipt" => Some(InvoiceKind::Receipt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    Issued,
    Sent,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "issued" => Some(InvoiceStatus::Issued),
            "sent" => Some(InvoiceStatus::Sent),
            "paid" => Some(InvoiceStatus::Paid),
            "cancelled" => Some(InvoiceStatus::Cancelled),
            _ => None,
        }
    }

    /// Status is the only mutable part of an invoice. Cancelled is terminal.
    pub fn can_become(&self, to: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        match (self, to) {
            (Issued, Sent) | (Issued, Paid) | (Sent, Paid) => true,
            (Cancelled, _) => false,
            (_, Cancelled) => true,
            _ => false,
        }
    }
}

/// One priced line on an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// VAT-style percentage. Tourist tax is billed as its own flat line,
    /// so every line currently carries zero.
    pub tax_rate: Decimal,
    pub total: Decimal,
}

/// An issued invoice. Everything except `status` is immutable after issue;
/// corrections are made by cancelling and issuing a fresh document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Ulid,
    /// Sequential per property, assigned at issue, never reused.
    pub number: u64,
    pub kind: InvoiceKind,
    pub status: InvoiceStatus,
    pub booking_id: Ulid,
    pub lines: Vec<LineItem>,
    pub total_amount: Decimal,
    pub issued_at: Ms,
}

/// Invoice registry plus the monotonic number counter. Lives behind its own
/// lock so issuing paperwork never contends with calendar writes.
#[derive(Debug, Clone)]
pub struct InvoiceLedger {
    /// Append-only, ordered by `number`.
    pub invoices: Vec<Invoice>,
    pub next_number: u64,
}

impl InvoiceLedger {
    pub fn new() -> Self {
        Self {
            invoices: Vec::new(),
            next_number: 1,
        }
    }

    pub fn find(&self, id: Ulid) -> Option<&Invoice> {
        self.invoices.iter().find(|i| i.id == id)
    }

    pub fn find_mut(&mut self, id: Ulid) -> Option<&mut Invoice> {
        self.invoices.iter_mut().find(|i| i.id == id)
    }

    /// The non-cancelled invoice for a booking, if one exists. At most one
    /// can be open at a time.
    pub fn open_for_booking(&self, booking_id: Ulid) -> Option<&Invoice> {
        self.invoices
            .iter()
            .find(|i| i.booking_id == booking_id && i.status != InvoiceStatus::Cancelled)
    }
}

impl Default for InvoiceLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the engine tracks for one rental unit. Guarded by a single
/// `RwLock`; the write side is the only place the calendar is checked and
/// extended, which is what makes check-then-reserve atomic.
#[derive(Debug, Clone)]
pub struct UnitState {
    pub settings: PricingSettings,
    /// Seasonal rules, unordered. Per-night resolution picks the winner.
    pub seasons: Vec<SeasonRule>,
    /// Next season `seq` to hand out.
    pub season_seq: u64,
    /// Live calendar entries (holds plus confirmed stays), sorted by range.start.
    pub entries: Vec<CalendarEntry>,
    /// Every booking ever placed, cancelled ones included.
    pub bookings: HashMap<Ulid, Booking>,
}

impl UnitState {
    pub fn new() -> Self {
        Self {
            settings: PricingSettings::default(),
            seasons: Vec::new(),
            season_seq: 1,
            entries: Vec::new(),
            bookings: HashMap::new(),
        }
    }

    /// Insert a calendar entry maintaining sort order by range.start.
    pub fn insert_entry(&mut self, entry: CalendarEntry) {
        let pos = self
            .entries
            .binary_search_by_key(&entry.range.start, |e| e.range.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    /// Remove the calendar entry for a booking.
    pub fn remove_entry(&mut self, booking_id: Ulid) -> Option<CalendarEntry> {
        if let Some(pos) = self.entries.iter().position(|e| e.booking_id == booking_id) {
            Some(self.entries.remove(pos))
        } else {
            None
        }
    }

    pub fn entry(&self, booking_id: Ulid) -> Option<&CalendarEntry> {
        self.entries.iter().find(|e| e.booking_id == booking_id)
    }

    pub fn entry_mut(&mut self, booking_id: Ulid) -> Option<&mut CalendarEntry> {
        self.entries.iter_mut().find(|e| e.booking_id == booking_id)
    }

    /// Return only entries whose range overlaps the query window.
    /// Uses binary search to skip entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &CalendarEntry> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.entries.partition_point(|e| e.range.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.range.end > query.start)
    }

    pub fn season_mut(&mut self, id: Ulid) -> Option<&mut SeasonRule> {
        self.seasons.iter_mut().find(|s| s.id == id)
    }
}

impl Default for UnitState {
    fn default() -> Self {
        Self::new()
    }
}

/// One field assignment from `UPDATE settings SET ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsChange {
    DefaultNightlyRate(Decimal),
    CleaningFee(Decimal),
    PetCleaningFee(Decimal),
    ExtraGuestFee(Decimal),
    ExtraGuestThreshold(u32),
    TouristTax(Decimal),
    TaxCapNights(Option<u32>),
    MaxGuests(u32),
}

/// Field assignments from `UPDATE seasons SET ...`. Unset fields keep their
/// current value; `name: Some(None)` clears the name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeasonPatch {
    pub name: Option<Option<String>>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub nightly_rate: Option<Decimal>,
    pub active: Option<bool>,
}

/// The event types. This is the WAL record format; replay folds these over
/// an empty `UnitState` and `InvoiceLedger`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SettingsUpdated {
        settings: PricingSettings,
    },
    SeasonAdded {
        rule: SeasonRule,
    },
    /// Carries the full new rule, fresh `seq` included.
    SeasonUpdated {
        rule: SeasonRule,
    },
    SeasonRemoved {
        id: Ulid,
    },
    HoldPlaced {
        id: Ulid,
        range: DateRange,
        guests: u32,
        pets: bool,
        contact: GuestContact,
        breakdown: PriceBreakdown,
        expires_at: Ms,
        created_at: Ms,
    },
    HoldReleased {
        id: Ulid,
        expired: bool,
    },
    BookingConfirmed {
        id: Ulid,
    },
    BookingCheckedIn {
        id: Ulid,
    },
    BookingCompleted {
        id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
    },
    InvoiceIssued {
        invoice: Invoice,
    },
    InvoiceStatusChanged {
        id: Ulid,
        status: InvoiceStatus,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldInfo {
    pub id: Ulid,
    pub range: DateRange,
    pub guests: u32,
    pub expires_at: Ms,
}
