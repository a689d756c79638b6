mod allocator;
mod conflict;
mod error;
mod generator;
mod mutations;
mod pricing;
mod queries;
mod schedule;
#[cfg(test)]
mod tests;

pub use conflict::ResourceShortfall;
pub use error::EngineError;
pub use pricing::price_quote;
pub use schedule::{eligible_dates, tile_day, validate_range, validate_template};

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSlotState = Arc<RwLock<SlotState>>;
pub type SharedLedger = Arc<RwLock<ResourceLedger>>;

/// Write guards over a set of ledgers, acquired in ascending resource id order.
pub(crate) type LedgerGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<ResourceLedger>>;

/// `(tour, date, start)`: at most one slot per tour starts at a given moment.
pub(crate) type SlotKey = (Ulid, NaiveDate, NaiveTime);

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
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// In-memory scheduling state for one tour operator.
///
/// Lock order, outermost first: `log_gate` (read for every mutation), the
/// per-tour generation mutex, resource ledgers in ascending id order, then a
/// single slot. Booking paths only ever take the slot lock.
pub struct Engine {
    pub tours: DashMap<Ulid, Tour>,
    pub resources: DashMap<Ulid, Resource>,
    pub templates: DashMap<Ulid, AvailabilityTemplate>,
    pub slots: DashMap<Ulid, SharedSlotState>,
    pub(super) ledgers: DashMap<Ulid, SharedLedger>,
    pub(super) slot_keys: DashMap<SlotKey, Ulid>,
    /// Template → slots generated from it.
    pub(super) template_slots: DashMap<Ulid, Vec<Ulid>>,
    pub(super) booking_to_slot: DashMap<Ulid, Ulid>,
    pub(super) booking_codes: DashMap<String, Ulid>,
    pub(super) tour_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Serialises catalog pushes so log order equals apply order.
    pub(super) catalog_lock: Mutex<()>,
    /// Held shared by mutations, exclusively by compaction.
    pub(super) log_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply an event to one resource's ledger (caller holds the lock).
fn apply_to_ledger(ledger: &mut ResourceLedger, event: &Event) {
    match event {
        Event::SlotCreated { slot, replaced } => {
            if let Some(old) = replaced {
                ledger.remove_slot(*old);
            }
            if slot.status == SlotStatus::Cancelled {
                return;
            }
            for c in &slot.commitments {
                if c.resource_id == ledger.resource_id {
                    ledger.insert(LedgerEntry {
                        slot_id: slot.id,
                        date: slot.date,
                        window: slot.window,
                        quantity: c.quantity_used,
                    });
                }
            }
        }
        Event::SlotCancelled { id, .. } | Event::SlotDeleted { id, .. } => {
            ledger.remove_slot(*id);
        }
        _ => {}
    }
}

/// Apply an event to one slot and its bookings (caller holds the lock).
fn apply_to_slot(ss: &mut SlotState, event: &Event) {
    match event {
        Event::SlotUpdated {
            total_capacity,
            notes,
            ..
        } => {
            ss.slot.total_capacity = *total_capacity;
            ss.slot.notes = notes.clone();
        }
        Event::SlotCancelled { .. } => {
            ss.slot.status = SlotStatus::Cancelled;
        }
        Event::BookingCreated { booking } => {
            if booking.status.holds_seat() {
                ss.slot.booked_count += booking.participants;
            }
            ss.bookings.push(booking.clone());
        }
        Event::BookingStatusChanged {
            id,
            status,
            at,
            note,
            ..
        } => {
            let mut released = 0;
            if let Some(b) = ss.booking_mut(*id) {
                let held = b.status.holds_seat();
                b.enter_status(*status, *at);
                if let Some(note) = note {
                    b.append_note(*at, note);
                }
                if held && !status.holds_seat() {
                    released = b.participants;
                }
            }
            ss.slot.booked_count = ss.slot.booked_count.saturating_sub(released);
        }
        Event::BookingContactUpdated { id, customer, .. } => {
            if let Some(b) = ss.booking_mut(*id) {
                b.customer = customer.clone();
            }
        }
        Event::BookingDeleted { id, .. } => {
            if let Some(b) = ss.remove_booking(*id)
                && b.status.holds_seat()
            {
                ss.slot.booked_count = ss.slot.booked_count.saturating_sub(b.participants);
            }
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tours: DashMap::new(),
            resources: DashMap::new(),
            templates: DashMap::new(),
            slots: DashMap::new(),
            ledgers: DashMap::new(),
            slot_keys: DashMap::new(),
            template_slots: DashMap::new(),
            booking_to_slot: DashMap::new(),
            booking_codes: DashMap::new(),
            tour_locks: DashMap::new(),
            catalog_lock: Mutex::new(()),
            log_gate: RwLock::new(()),
            wal_tx,
            notify,
        };

        // Replay: we're the sole owner of every lock, so try_read/try_write always
        // succeed. Never use blocking_* here because this may run inside an async
        // context (lazy tenant creation).
        for event in &events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::SlotCreated { slot, replaced } => {
                for rid in replay_ledger_ids(self, slot, *replaced) {
                    if let Ok(mut guard) = self.ledger(rid).try_write() {
                        apply_to_ledger(&mut guard, event);
                    }
                }
                if let Some(old) = replaced
                    && let Some(shared) = self.get_slot(old)
                    && let Ok(mut ss) = shared.try_write()
                {
                    self.forget_slot(&mut ss);
                }
                self.insert_slot(slot.clone());
            }
            Event::SlotCancelled { id, .. } | Event::SlotDeleted { id, .. } => {
                let Some(shared) = self.get_slot(id) else {
                    return;
                };
                let Ok(mut ss) = shared.try_write() else {
                    return;
                };
                for c in &ss.slot.commitments {
                    if let Some(ledger) = self.ledgers.get(&c.resource_id)
                        && let Ok(mut guard) = ledger.try_write()
                    {
                        apply_to_ledger(&mut guard, event);
                    }
                }
                if matches!(event, Event::SlotDeleted { .. }) {
                    self.forget_slot(&mut ss);
                } else {
                    apply_to_slot(&mut ss, event);
                }
            }
            Event::SlotUpdated { id, .. } => {
                if let Some(shared) = self.get_slot(id)
                    && let Ok(mut ss) = shared.try_write()
                {
                    apply_to_slot(&mut ss, event);
                }
            }
            Event::BookingCreated { booking } => {
                if let Some(shared) = self.get_slot(&booking.slot_id)
                    && let Ok(mut ss) = shared.try_write()
                {
                    apply_to_slot(&mut ss, event);
                    self.booking_to_slot.insert(booking.id, booking.slot_id);
                    self.booking_codes.insert(booking.code.clone(), booking.id);
                }
            }
            Event::BookingStatusChanged { slot_id, .. }
            | Event::BookingContactUpdated { slot_id, .. } => {
                if let Some(shared) = self.get_slot(slot_id)
                    && let Ok(mut ss) = shared.try_write()
                {
                    apply_to_slot(&mut ss, event);
                }
            }
            Event::BookingDeleted { id, slot_id, .. } => {
                if let Some(shared) = self.get_slot(slot_id)
                    && let Ok(mut ss) = shared.try_write()
                {
                    if let Some(b) = ss.booking(*id) {
                        self.booking_codes.remove(&b.code);
                    }
                    apply_to_slot(&mut ss, event);
                    self.booking_to_slot.remove(id);
                }
            }
            catalog => self.apply_catalog(catalog),
        }
    }

    /// Apply a catalog event. Catalog entries are plain map values.
    pub(super) fn apply_catalog(&self, event: &Event) {
        match event {
            Event::TourUpserted {
                id,
                base_price,
                min_participants,
                max_participants,
            } => {
                let mut tour = self.tours.entry(*id).or_insert_with(|| Tour {
                    id: *id,
                    base_price: *base_price,
                    min_participants: *min_participants,
                    max_participants: *max_participants,
                    requirements: Vec::new(),
                });
                tour.base_price = *base_price;
                tour.min_participants = *min_participants;
                tour.max_participants = *max_participants;
            }
            Event::RequirementSet {
                tour_id,
                resource_id,
                quantity_needed,
            } => {
                if let Some(mut tour) = self.tours.get_mut(tour_id) {
                    tour.requirements.retain(|r| r.resource_id != *resource_id);
                    if *quantity_needed > 0 {
                        tour.requirements.push(ResourceRequirement {
                            resource_id: *resource_id,
                            quantity_needed: *quantity_needed,
                        });
                    }
                }
            }
            Event::ResourceUpserted {
                id,
                name,
                total_quantity,
                seats_per_unit,
            } => {
                self.resources.insert(
                    *id,
                    Resource {
                        id: *id,
                        name: name.clone(),
                        total_quantity: *total_quantity,
                        seats_per_unit: *seats_per_unit,
                    },
                );
                self.ledger(*id);
            }
            Event::TemplateUpserted { template } => {
                self.templates.insert(template.id, template.clone());
            }
            Event::TemplateDeleted { id } => {
                self.templates.remove(id);
                self.template_slots.remove(id);
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    pub(super) fn publish(&self, event: &Event) {
        if let Some(tour_id) = event.tour_id() {
            self.notify.send(tour_id, event);
        }
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn slot_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_slot.get(booking_id).map(|e| *e.value())
    }

    pub(super) fn ledger(&self, resource_id: Ulid) -> SharedLedger {
        self.ledgers
            .entry(resource_id)
            .or_insert_with(|| Arc::new(RwLock::new(ResourceLedger::new(resource_id))))
            .clone()
    }

    pub(super) fn tour_lock(&self, tour_id: Ulid) -> Arc<Mutex<()>> {
        self.tour_locks.entry(tour_id).or_default().clone()
    }

    /// Write-lock the ledgers of `resource_ids` in ascending id order.
    pub(super) async fn lock_ledgers(
        &self,
        resource_ids: impl IntoIterator<Item = Ulid>,
    ) -> LedgerGuards {
        let ordered: BTreeSet<Ulid> = resource_ids.into_iter().collect();
        let mut guards = BTreeMap::new();
        for rid in ordered {
            let guard = self.ledger(rid).write_owned().await;
            guards.insert(rid, guard);
        }
        guards
    }

    /// WAL-append + apply + notify for an event scoped to one slot.
    pub(super) async fn persist_to_slot(
        &self,
        ss: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_slot(ss, event);
        self.publish(event);
        Ok(())
    }

    /// WAL-append + apply for a slot creation. The caller holds the ledgers of
    /// every committed resource and, when replacing, the old slot's lock and ledgers.
    pub(super) async fn persist_slot(
        &self,
        ledgers: &mut LedgerGuards,
        slot: TimeSlot,
        replaced: Option<&mut SlotState>,
    ) -> Result<(), EngineError> {
        let event = Event::SlotCreated {
            slot,
            replaced: replaced.as_ref().map(|ss| ss.slot.id),
        };
        self.wal_append(&event).await?;
        for guard in ledgers.values_mut() {
            apply_to_ledger(guard, &event);
        }
        if let Some(old) = replaced {
            self.forget_slot(old);
        }
        if let Event::SlotCreated { slot, .. } = &event {
            self.insert_slot(slot.clone());
        }
        self.publish(&event);
        Ok(())
    }

    /// WAL-append + apply for a cancellation or deletion. The caller holds the
    /// slot's write lock and the ledgers of its commitments.
    pub(super) async fn persist_slot_removal(
        &self,
        ledgers: &mut LedgerGuards,
        ss: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for guard in ledgers.values_mut() {
            apply_to_ledger(guard, event);
        }
        match event {
            Event::SlotDeleted { .. } => self.forget_slot(ss),
            _ => apply_to_slot(ss, event),
        }
        self.publish(event);
        Ok(())
    }

    fn insert_slot(&self, slot: TimeSlot) {
        self.slot_keys
            .insert((slot.tour_id, slot.date, slot.window.start), slot.id);
        if let Some(tid) = slot.template_id {
            self.template_slots.entry(tid).or_default().push(slot.id);
        }
        self.slots
            .insert(slot.id, Arc::new(RwLock::new(SlotState::new(slot))));
    }

    fn unindex_slot(&self, slot: &TimeSlot) {
        let key = (slot.tour_id, slot.date, slot.window.start);
        self.slot_keys.remove_if(&key, |_, id| *id == slot.id);
        if let Some(tid) = slot.template_id
            && let Some(mut ids) = self.template_slots.get_mut(&tid)
        {
            ids.retain(|id| *id != slot.id);
        }
    }

    /// Drop a slot and its bookings from every index. Ledgers are handled by the caller.
    fn forget_slot(&self, ss: &mut SlotState) {
        for b in ss.bookings.drain(..) {
            self.booking_to_slot.remove(&b.id);
            self.booking_codes.remove(&b.code);
        }
        self.unindex_slot(&ss.slot);
        self.slots.remove(&ss.slot.id);
    }
}

/// Resources whose ledgers a replayed `SlotCreated` touches.
fn replay_ledger_ids(engine: &Engine, slot: &TimeSlot, replaced: Option<Ulid>) -> BTreeSet<Ulid> {
    let mut ids: BTreeSet<Ulid> = slot.commitments.iter().map(|c| c.resource_id).collect();
    if let Some(old) = replaced
        && let Some(shared) = engine.get_slot(&old)
        && let Ok(ss) = shared.try_read()
    {
        ids.extend(ss.slot.commitments.iter().map(|c| c.resource_id));
    }
    ids
}
