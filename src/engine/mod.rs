mod availability;
mod conflict;
mod error;
pub mod ledger;
pub mod lifecycle;
mod mutations;
pub mod pricing;
mod queries;

pub use availability::{
    compute_saturated_spans, merge_overlapping, place_free_windows, slot_free_windows,
    subtract_intervals,
};
pub use conflict::{find_conflict, has_conflict};
pub(crate) use conflict::now_ms;
pub use error::EngineError;
pub use mutations::NewBooking;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedPlaceState = Arc<RwLock<PlaceState>>;

/// Principal recorded on transitions the engine performs by itself.
pub const SYSTEM_ACTOR: &str = "system";

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
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedPlaceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: slot or booking id → place id
    pub(super) entity_to_place: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared, before any place lock and until the event
    /// is applied. Compaction holds it exclusively from snapshot to log swap.
    pub(super) wal_gate: RwLock<()>,
}

/// Apply an event to a PlaceState. The caller holds the lock.
///
/// Infallible: every guard was checked before the event hit the WAL, and
/// replay feeds back only events that were valid when written.
fn apply_to_place(ps: &mut PlaceState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::SlotAdded { id, place_id, label, pricing } => {
            let slot = SlotState::new(*id, *place_id, label.clone(), *pricing);
            ps.capacity.on_slot_added(slot.status);
            ps.slots.push(slot);
            entity_map.insert(*id, *place_id);
        }
        Event::SlotStatusSet { id, status, .. } => {
            if let Some(slot) = ps.slot_mut(id) {
                slot.operator_status = *status;
            }
            ledger::sync_slot_status(ps, id);
        }
        Event::SlotRemoved { id, .. } => {
            if let Some(pos) = ps.slots.iter().position(|s| s.id == *id) {
                let slot = ps.slots.remove(pos);
                ps.capacity.on_slot_removed(slot.status);
                for b in &slot.bookings {
                    entity_map.remove(&b.id);
                }
            }
            entity_map.remove(id);
        }
        Event::BookingCreated { booking } => {
            let slot_id = booking.slot_id;
            if let Some(slot) = ps.slot_mut(&slot_id) {
                slot.insert_booking(booking.clone());
                entity_map.insert(booking.id, booking.place_id);
            }
            ledger::sync_slot_status(ps, &slot_id);
        }
        Event::BookingRescheduled { id, span, amount, vehicle, .. } => {
            if let Some(slot) = ps.slots.iter_mut().find(|s| s.booking(id).is_some())
                && let Some(mut b) = slot.remove_booking(*id) {
                    b.span = *span;
                    b.amount = *amount;
                    b.vehicle = vehicle.clone();
                    slot.insert_booking(b);
                }
        }
        Event::PaymentConfirmed { id, method, transaction_id, paid_at, .. } => {
            update_booking(ps, id, |b| {
                b.status = BookingStatus::Confirmed;
                b.payment = Payment {
                    method: Some(method.clone()),
                    status: PaymentStatus::Paid,
                    transaction_id: transaction_id.clone(),
                    paid_at: Some(*paid_at),
                };
            });
        }
        Event::BookingCancelled { id, cancellation, .. } => {
            update_booking(ps, id, |b| {
                b.status = BookingStatus::Cancelled;
                if b.payment.status == PaymentStatus::Paid {
                    b.payment.status = PaymentStatus::Refunded;
                }
                b.cancellation = Some(cancellation.clone());
            });
        }
        Event::CheckedIn { id, stamp, .. } => {
            update_booking(ps, id, |b| b.check_in = Some(stamp.clone()));
        }
        Event::CheckedOut { id, stamp, .. } => {
            update_booking(ps, id, |b| {
                b.status = BookingStatus::Completed;
                b.check_out = Some(stamp.clone());
            });
        }
        Event::BookingElapsed { id, at, .. } => {
            update_booking(ps, id, |b| {
                let outcome = lifecycle::elapsed_outcome(b);
                if outcome == BookingStatus::Completed {
                    b.check_out = Some(Stamp { time: *at, by: SYSTEM_ACTOR.into() });
                }
                b.status = outcome;
            });
        }
        // PlaceCreated/Deleted are handled at the DashMap level, not here
        Event::PlaceCreated { .. } | Event::PlaceDeleted { .. } => {}
    }
}

/// Mutate one booking in place, then resync its slot.
fn update_booking(ps: &mut PlaceState, id: &Ulid, f: impl FnOnce(&mut Booking)) {
    let mut slot_id = None;
    for slot in ps.slots.iter_mut() {
        if let Some(b) = slot.booking_mut(id) {
            f(b);
            slot_id = Some(slot.id);
            break;
        }
    }
    if let Some(slot_id) = slot_id {
        ledger::sync_slot_status(ps, &slot_id);
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            entity_to_place: DashMap::new(),
            wal_gate: RwLock::new(()),
        };

        // Replay: we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never block here; this may run inside a runtime.
        for event in &events {
            match event {
                Event::PlaceCreated { id, name, pricing } => {
                    let ps = PlaceState::new(*id, name.clone(), *pricing);
                    engine.state.insert(*id, Arc::new(RwLock::new(ps)));
                }
                Event::PlaceDeleted { id } => {
                    engine.state.remove(id);
                }
                other => {
                    if let Some(entry) = engine.state.get(&other.place_id()) {
                        let ps_arc = entry.clone();
                        let Ok(mut guard) = ps_arc.try_write() else {
                            return Err(io::Error::other("replay: place state contended"));
                        };
                        apply_to_place(&mut guard, other, &engine.entity_to_place);
                    }
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
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub fn get_place(&self, id: &Ulid) -> Option<SharedPlaceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_place_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_place.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        place_id: Ulid,
        ps: &mut PlaceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_place(ps, event, &self.entity_to_place);
        self.notify.send(place_id, event);
        Ok(())
    }

    /// Lookup entity → place, get place, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<PlaceState>), EngineError> {
        let place_id = self
            .get_place_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ps = self
            .get_place(&place_id)
            .ok_or(EngineError::NotFound(place_id))?;
        let guard = ps.write_owned().await;
        Ok((place_id, guard))
    }

    pub(super) async fn resolve_entity_read(
        &self,
        entity_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<PlaceState>, EngineError> {
        let place_id = self
            .get_place_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ps = self
            .get_place(&place_id)
            .ok_or(EngineError::NotFound(place_id))?;
        Ok(ps.read_owned().await)
    }
}

pub(super) fn require_admin(principal: &Principal, id: Ulid) -> Result<(), EngineError> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden(id))
    }
}

pub(super) fn require_owner(principal: &Principal, booking: &Booking) -> Result<(), EngineError> {
    if principal.may_access(&booking.user_id) {
        Ok(())
    } else {
        Err(EngineError::Forbidden(booking.id))
    }
}
