mod conflict;
mod error;
mod invoices;
mod mutations;
mod pricing;
mod queries;

pub use error::EngineError;
pub use pricing::{compute_breakdown, rate_for_night};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedUnitState = Arc<RwLock<UnitState>>;

/// How long a writer waits for the calendar lock before giving up with
/// `Contention`. Callers see the same "unavailable" class of failure a
/// date conflict produces, instead of queueing behind a stuck writer.
const WRITE_LOCK_WAIT: Duration = Duration::from_secs(2);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
    result: &io::Result<()>,
) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The availability and pricing engine for one property: a single unit's
/// calendar, rates, and bookings, plus its invoice ledger, all rebuilt from
/// the WAL on startup.
pub struct Engine {
    unit: SharedUnitState,
    /// Issued invoices plus the number counter. Separate lock, so issuing
    /// paperwork is serialized by the counter and nothing else.
    ledger: Arc<Mutex<InvoiceLedger>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// New holds expire at placement time + this.
    pub(super) hold_ttl_ms: Ms,
}

/// Apply a calendar/settings event to the unit (no locking; caller holds the lock).
fn apply_to_unit(unit: &mut UnitState, event: &Event) {
    match event {
        Event::SettingsUpdated { settings } => {
            unit.settings = settings.clone();
        }
        Event::SeasonAdded { rule } | Event::SeasonUpdated { rule } => {
            unit.season_seq = unit.season_seq.max(rule.seq + 1);
            if let Some(existing) = unit.season_mut(rule.id) {
                *existing = rule.clone();
            } else {
                unit.seasons.push(rule.clone());
            }
        }
        Event::SeasonRemoved { id } => {
            unit.seasons.retain(|s| s.id != *id);
        }
        Event::HoldPlaced {
            id,
            range,
            guests,
            pets,
            contact,
            breakdown,
            expires_at,
            created_at,
        } => {
            unit.insert_entry(CalendarEntry {
                booking_id: *id,
                range: *range,
                kind: EntryKind::Hold {
                    expires_at: *expires_at,
                },
            });
            unit.bookings.insert(
                *id,
                Booking {
                    id: *id,
                    range: *range,
                    guests: *guests,
                    pets: *pets,
                    contact: contact.clone(),
                    status: BookingStatus::Held,
                    breakdown: breakdown.clone(),
                    created_at: *created_at,
                },
            );
        }
        Event::HoldReleased { id, .. } | Event::BookingCancelled { id } => {
            unit.remove_entry(*id);
            if let Some(b) = unit.bookings.get_mut(id) {
                b.status = BookingStatus::Cancelled;
            }
        }
        Event::BookingConfirmed { id } => {
            if let Some(entry) = unit.entry_mut(*id) {
                entry.kind = EntryKind::Booked;
            }
            if let Some(b) = unit.bookings.get_mut(id) {
                b.status = BookingStatus::Confirmed;
            }
        }
        Event::BookingCheckedIn { id } => {
            if let Some(b) = unit.bookings.get_mut(id) {
                b.status = BookingStatus::CheckedIn;
            }
        }
        Event::BookingCompleted { id } => {
            // Completed stays leave the live calendar; the booking record
            // keeps the history. Keeps the calendar bounded by live entries.
            unit.remove_entry(*id);
            if let Some(b) = unit.bookings.get_mut(id) {
                b.status = BookingStatus::Completed;
            }
        }
        // Ledger events, handled by apply_to_ledger.
        Event::InvoiceIssued { .. } | Event::InvoiceStatusChanged { .. } => {}
    }
}

/// Apply an invoice event to the ledger (caller holds the ledger lock).
fn apply_to_ledger(ledger: &mut InvoiceLedger, event: &Event) {
    match event {
        Event::InvoiceIssued { invoice } => {
            ledger.next_number = ledger.next_number.max(invoice.number + 1);
            ledger.invoices.push(invoice.clone());
        }
        Event::InvoiceStatusChanged { id, status } => {
            if let Some(inv) = ledger.find_mut(*id) {
                inv.status = *status;
            }
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, hold_ttl_ms: Ms) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            unit: Arc::new(RwLock::new(UnitState::new())),
            ledger: Arc::new(Mutex::new(InvoiceLedger::new())),
            wal_tx,
            notify,
            hold_ttl_ms,
        };

        // Replay events. We're the sole owner of these locks, so try_write/
        // try_lock always succeed instantly (no contention). Never use
        // blocking_write here because this may run inside an async context
        // (e.g. lazy property creation).
        for event in &events {
            match event {
                Event::InvoiceIssued { .. } | Event::InvoiceStatusChanged { .. } => {
                    let mut ledger = engine
                        .ledger
                        .try_lock()
                        .expect("replay: uncontended ledger lock");
                    apply_to_ledger(&mut ledger, event);
                }
                other => {
                    let mut unit = engine.unit.try_write().expect("replay: uncontended write");
                    apply_to_unit(&mut unit, other);
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Take the calendar write lock, giving up after `WRITE_LOCK_WAIT`.
    /// Timing out is counted and logged separately from date conflicts.
    pub(super) async fn lock_unit_write(
        &self,
    ) -> Result<OwnedRwLockWriteGuard<UnitState>, EngineError> {
        match tokio::time::timeout(WRITE_LOCK_WAIT, self.unit.clone().write_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                metrics::counter!(crate::observability::HOLD_CONTENTION_TOTAL).increment(1);
                tracing::warn!(
                    wait_ms = WRITE_LOCK_WAIT.as_millis() as u64,
                    "calendar write lock wait exceeded"
                );
                Err(EngineError::Contention)
            }
        }
    }

    pub(super) async fn lock_unit_read(&self) -> OwnedRwLockReadGuard<UnitState> {
        self.unit.clone().read_owned().await
    }

    pub(super) async fn lock_ledger(&self) -> OwnedMutexGuard<InvoiceLedger> {
        self.ledger.clone().lock_owned().await
    }

    /// WAL-append + apply + notify in one call. Caller holds the calendar
    /// write lock across the append, so observers never see unlogged state.
    pub(super) async fn persist_and_apply(
        &self,
        unit: &mut UnitState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_unit(unit, event);
        self.notify.send(event);
        Ok(())
    }

    /// Same, for ledger events. Caller holds the ledger lock.
    pub(super) async fn persist_and_apply_ledger(
        &self,
        ledger: &mut InvoiceLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_ledger(ledger, event);
        self.notify.send(event);
        Ok(())
    }
}
