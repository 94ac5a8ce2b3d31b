use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, has_conflict, now_ms, validate_span};
use super::lifecycle::{self, Step, Transition};
use super::pricing::{price_span, validate_pricing};
use super::{require_admin, require_owner, Engine, EngineError, WalCommand};

/// Everything a caller supplies to reserve a specific slot.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub id: Ulid,
    pub place_id: Ulid,
    pub slot_id: Ulid,
    pub span: Span,
    pub vehicle: Vehicle,
}

fn validate_vehicle(v: &Vehicle) -> Result<(), EngineError> {
    if v.plate.trim().is_empty() {
        return Err(EngineError::Validation("vehicle plate is required"));
    }
    if v.plate.len() > MAX_PLATE_LEN {
        return Err(EngineError::LimitExceeded("vehicle plate too long"));
    }
    if let Some(ref k) = v.kind
        && k.len() > MAX_LABEL_LEN {
            return Err(EngineError::LimitExceeded("vehicle kind too long"));
        }
    Ok(())
}

fn validate_principal(p: &Principal) -> Result<(), EngineError> {
    if p.user_id.is_empty() {
        return Err(EngineError::Validation("user id is required"));
    }
    if p.user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    Ok(())
}

/// Look up a booking, check ownership, and evaluate the transition guard
/// against the state currently under the lock.
fn guarded(
    ps: &PlaceState,
    principal: &Principal,
    id: Ulid,
    t: Transition<'_>,
    now: Ms,
) -> Result<(Booking, Step), EngineError> {
    let b = ps.booking(&id).ok_or(EngineError::NotFound(id))?;
    require_owner(principal, b)?;
    let step = lifecycle::evaluate(b, t, now).map_err(|reason| EngineError::InvalidTransition {
        id,
        status: b.status,
        reason,
    })?;
    Ok((b.clone(), step))
}

fn committed(ps: &PlaceState, id: Ulid) -> Result<Booking, EngineError> {
    ps.booking(&id).cloned().ok_or(EngineError::NotFound(id))
}

/// Slot choice for quick-book: the first idle slot, else the first in-service
/// slot with room for `span`.
fn pick_slot(ps: &PlaceState, span: &Span) -> Option<Ulid> {
    ps.slots
        .iter()
        .find(|s| is_available(s.status) && !has_conflict(s, span, None))
        .or_else(|| {
            ps.slots
                .iter()
                .find(|s| s.in_service() && !has_conflict(s, span, None))
        })
        .map(|s| s.id)
}

impl Engine {
    // ── Places & slots (operator) ────────────────────────────

    pub async fn create_place(
        &self,
        principal: &Principal,
        id: Ulid,
        name: Option<String>,
        pricing: Pricing,
    ) -> Result<PlaceInfo, EngineError> {
        require_admin(principal, id)?;
        if self.state.len() >= MAX_PLACES {
            return Err(EngineError::LimitExceeded("too many places"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("place name too long"));
            }
        let _gate = self.wal_gate.read().await;
        validate_pricing(&pricing)?;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::PlaceCreated { id, name: name.clone(), pricing };
        self.wal_append(&event).await?;
        let ps = PlaceState::new(id, name, pricing);
        let info = PlaceInfo::from_state(&ps);
        self.state.insert(id, Arc::new(RwLock::new(ps)));
        self.notify.send(id, &event);
        tracing::info!(place = %id, "place created");
        Ok(info)
    }

    pub async fn delete_place(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        require_admin(principal, id)?;
        let _gate = self.wal_gate.read().await;
        let ps = self.get_place(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ps.write().await;
        if !guard.slots.is_empty() {
            return Err(EngineError::HasSlots(id));
        }

        let event = Event::PlaceDeleted { id };
        self.wal_append(&event).await?;
        self.state.remove(&id);
        drop(guard);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        tracing::info!(place = %id, "place deleted");
        Ok(())
    }

    /// Add a slot. Without its own pricing the slot copies the place default.
    pub async fn add_slot(
        &self,
        principal: &Principal,
        id: Ulid,
        place_id: Ulid,
        label: Option<String>,
        pricing: Option<Pricing>,
    ) -> Result<SlotInfo, EngineError> {
        require_admin(principal, id)?;
        if let Some(ref l) = label
            && l.len() > MAX_LABEL_LEN {
                return Err(EngineError::LimitExceeded("slot label too long"));
            }
        let _gate = self.wal_gate.read().await;
        let ps = self.get_place(&place_id).ok_or(EngineError::NotFound(place_id))?;
        let mut guard = ps.write().await;
        if !self.state.contains_key(&place_id) {
            return Err(EngineError::NotFound(place_id));
        }
        if guard.slots.len() >= MAX_SLOTS_PER_PLACE {
            return Err(EngineError::LimitExceeded("too many slots in place"));
        }
        if self.entity_to_place.contains_key(&id) || self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let pricing = pricing.unwrap_or(guard.pricing);
        validate_pricing(&pricing)?;

        let event = Event::SlotAdded { id, place_id, label, pricing };
        self.persist_and_apply(place_id, &mut guard, &event).await?;
        let slot = guard.slot(&id).ok_or(EngineError::NotFound(id))?;
        Ok(SlotInfo::from_state(slot))
    }

    /// Put a slot into or out of service. Live bookings stay; the slot simply
    /// stops accepting new ones.
    pub async fn set_slot_status(
        &self,
        principal: &Principal,
        id: Ulid,
        status: OperatorStatus,
    ) -> Result<SlotInfo, EngineError> {
        require_admin(principal, id)?;
        let _gate = self.wal_gate.read().await;
        let (place_id, mut guard) = self.resolve_entity_write(&id).await?;
        let slot = guard.slot(&id).ok_or(EngineError::NotFound(id))?;
        if slot.operator_status == status {
            return Ok(SlotInfo::from_state(slot));
        }

        let event = Event::SlotStatusSet { id, place_id, status };
        self.persist_and_apply(place_id, &mut guard, &event).await?;
        let slot = guard.slot(&id).ok_or(EngineError::NotFound(id))?;
        Ok(SlotInfo::from_state(slot))
    }

    pub async fn remove_slot(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        require_admin(principal, id)?;
        let _gate = self.wal_gate.read().await;
        let (place_id, mut guard) = self.resolve_entity_write(&id).await?;
        let slot = guard.slot(&id).ok_or(EngineError::NotFound(id))?;
        if slot.has_live_bookings() {
            return Err(EngineError::HasLiveBookings(id));
        }

        let event = Event::SlotRemoved { id, place_id };
        self.persist_and_apply(place_id, &mut guard, &event).await
    }

    // ── Reservations ─────────────────────────────────────────

    /// Validate, detect conflicts, price and commit a pending booking on
    /// `slot_id`, all under the caller's write lock.
    async fn reserve(
        &self,
        ps: &mut PlaceState,
        principal: &Principal,
        req: NewBooking,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let NewBooking { id, slot_id, span, vehicle, .. } = req;
        if self.entity_to_place.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let place_id = ps.id;
        let slot = match ps.slot(&slot_id) {
            Some(s) => s,
            None if self.entity_to_place.contains_key(&slot_id) => {
                return Err(EngineError::Validation("slot does not belong to place"));
            }
            None => return Err(EngineError::NotFound(slot_id)),
        };
        if !slot.in_service() {
            return Err(EngineError::SlotUnavailable(slot_id));
        }
        if slot.live_booking_count() >= MAX_LIVE_BOOKINGS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many live bookings on slot"));
        }
        if let Err(e) = check_no_conflict(slot, &span, None) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let booking = Booking {
            id,
            user_id: principal.user_id.clone(),
            place_id,
            slot_id,
            span,
            status: BookingStatus::Pending,
            amount: price_span(&span, &slot.pricing),
            vehicle,
            payment: Payment::unpaid(),
            check_in: None,
            check_out: None,
            cancellation: None,
            created_at: now,
        };
        let event = Event::BookingCreated { booking };
        self.persist_and_apply(place_id, ps, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::info!(booking = %id, slot = %slot_id, place = %place_id, "booking created");
        committed(ps, id)
    }

    fn precheck_new(
        principal: &Principal,
        span: &Span,
        vehicle: &Vehicle,
        now: Ms,
    ) -> Result<(), EngineError> {
        validate_principal(principal)?;
        validate_span(span)?;
        validate_vehicle(vehicle)?;
        if span.end <= now {
            return Err(EngineError::InvalidInterval("interval has already elapsed"));
        }
        Ok(())
    }

    pub async fn create_booking(
        &self,
        principal: &Principal,
        req: NewBooking,
    ) -> Result<Booking, EngineError> {
        let now = now_ms();
        Self::precheck_new(principal, &req.span, &req.vehicle, now)?;
        let _gate = self.wal_gate.read().await;
        let ps = self
            .get_place(&req.place_id)
            .ok_or(EngineError::NotFound(req.place_id))?;
        let mut guard = ps.write().await;
        self.reserve(&mut guard, principal, req, now).await
    }

    /// Book whichever slot of the place can take `span`.
    pub async fn quick_book(
        &self,
        principal: &Principal,
        id: Ulid,
        place_id: Ulid,
        span: Span,
        vehicle: Vehicle,
    ) -> Result<Booking, EngineError> {
        let now = now_ms();
        Self::precheck_new(principal, &span, &vehicle, now)?;
        let _gate = self.wal_gate.read().await;
        let ps = self.get_place(&place_id).ok_or(EngineError::NotFound(place_id))?;
        let mut guard = ps.write().await;
        let slot_id = pick_slot(&guard, &span).ok_or(EngineError::SlotUnavailable(place_id))?;
        let req = NewBooking { id, place_id, slot_id, span, vehicle };
        self.reserve(&mut guard, principal, req, now).await
    }

    /// Move a booking to a new interval on the same slot and/or change the
    /// vehicle. Pending bookings are re-priced; paid ones keep their amount
    /// and may only move to an interval of the same length.
    pub async fn update_booking(
        &self,
        principal: &Principal,
        id: Ulid,
        span: Option<Span>,
        vehicle: Option<Vehicle>,
    ) -> Result<Booking, EngineError> {
        if let Some(ref s) = span {
            validate_span(s)?;
        }
        if let Some(ref v) = vehicle {
            validate_vehicle(v)?;
        }
        let now = now_ms();
        let _gate = self.wal_gate.read().await;
        let (place_id, mut guard) = self.resolve_entity_write(&id).await?;
        let (current, _) = guarded(&guard, principal, id, Transition::Modify, now)?;

        let new_span = span.unwrap_or(current.span);
        let new_vehicle = vehicle.unwrap_or_else(|| current.vehicle.clone());
        if new_span == current.span && new_vehicle == current.vehicle {
            return Ok(current);
        }

        let mut amount = current.amount;
        if new_span != current.span {
            if new_span.start <= now {
                return Err(EngineError::InvalidInterval("new interval must start in the future"));
            }
            let slot = guard
                .slot(&current.slot_id)
                .ok_or(EngineError::NotFound(current.slot_id))?;
            if !slot.in_service() {
                return Err(EngineError::SlotUnavailable(slot.id));
            }
            if let Err(e) = check_no_conflict(slot, &new_span, Some(id)) {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                return Err(e);
            }
            match current.status {
                BookingStatus::Pending => amount = price_span(&new_span, &slot.pricing),
                _ if new_span.duration_ms() != current.span.duration_ms() => {
                    return Err(EngineError::InvalidTransition {
                        id,
                        status: current.status,
                        reason: "paid bookings can be moved but not resized",
                    });
                }
                _ => {}
            }
        }

        let event = Event::BookingRescheduled {
            id,
            place_id,
            span: new_span,
            amount,
            vehicle: new_vehicle,
        };
        self.persist_and_apply(place_id, &mut guard, &event).await?;
        committed(&guard, id)
    }

    pub async fn confirm_payment(
        &self,
        principal: &Principal,
        id: Ulid,
        method: String,
        transaction_id: Option<String>,
    ) -> Result<Booking, EngineError> {
        if method.trim().is_empty() {
            return Err(EngineError::Validation("payment method is required"));
        }
        if method.len() > MAX_PAYMENT_FIELD_LEN
            || transaction_id.as_ref().is_some_and(|t| t.len() > MAX_PAYMENT_FIELD_LEN)
        {
            return Err(EngineError::LimitExceeded("payment field too long"));
        }
        let now = now_ms();
        let _gate = self.wal_gate.read().await;
        let (place_id, mut guard) = self.resolve_entity_write(&id).await?;
        let t = Transition::ConfirmPayment { transaction_id: transaction_id.as_deref() };
        if let (b, Step::Noop) = guarded(&guard, principal, id, t, now)? {
            return Ok(b);
        }

        let event = Event::PaymentConfirmed { id, place_id, method, transaction_id, paid_at: now };
        self.persist_and_apply(place_id, &mut guard, &event).await?;
        tracing::info!(booking = %id, "payment confirmed");
        committed(&guard, id)
    }

    /// Cancel before the interval starts. Repeating a cancel returns the
    /// cancelled booking without touching slot or ledger again.
    pub async fn cancel_booking(
        &self,
        principal: &Principal,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("cancellation reason too long"));
        }
        let now = now_ms();
        let _gate = self.wal_gate.read().await;
        let (place_id, mut guard) = self.resolve_entity_write(&id).await?;
        let (current, step) = guarded(&guard, principal, id, Transition::Cancel, now)?;
        if step == Step::Noop {
            return Ok(current);
        }

        let cancellation = Cancellation {
            reason,
            cancelled_by: principal.user_id.clone(),
            cancelled_at: now,
            refund_amount: current.amount,
        };
        let event = Event::BookingCancelled { id, place_id, cancellation };
        self.persist_and_apply(place_id, &mut guard, &event).await?;
        tracing::info!(booking = %id, "booking cancelled");
        committed(&guard, id)
    }

    pub async fn check_in(&self, principal: &Principal, id: Ulid) -> Result<Booking, EngineError> {
        let now = now_ms();
        let _gate = self.wal_gate.read().await;
        let (place_id, mut guard) = self.resolve_entity_write(&id).await?;
        if let (b, Step::Noop) = guarded(&guard, principal, id, Transition::CheckIn, now)? {
            return Ok(b);
        }

        let stamp = Stamp { time: now, by: principal.user_id.clone() };
        let event = Event::CheckedIn { id, place_id, stamp };
        self.persist_and_apply(place_id, &mut guard, &event).await?;
        committed(&guard, id)
    }

    pub async fn check_out(&self, principal: &Principal, id: Ulid) -> Result<Booking, EngineError> {
        let now = now_ms();
        let _gate = self.wal_gate.read().await;
        let (place_id, mut guard) = self.resolve_entity_write(&id).await?;
        if let (b, Step::Noop) = guarded(&guard, principal, id, Transition::CheckOut, now)? {
            return Ok(b);
        }

        let stamp = Stamp { time: now, by: principal.user_id.clone() };
        let event = Event::CheckedOut { id, place_id, stamp };
        self.persist_and_apply(place_id, &mut guard, &event).await?;
        committed(&guard, id)
    }

    // ── Natural expiry ───────────────────────────────────────

    /// Live bookings whose interval ended at or before `now`.
    /// Places that are busy are skipped; the next sweep picks them up.
    pub fn collect_elapsed_bookings(&self, now: Ms) -> Vec<Ulid> {
        let mut elapsed = Vec::new();
        for entry in self.state.iter() {
            let ps = entry.value().clone();
            if let Ok(guard) = ps.try_read() {
                elapsed.extend(
                    guard
                        .bookings()
                        .filter(|b| b.is_live() && lifecycle::is_elapsed(b, now))
                        .map(|b| b.id),
                );
            }
        }
        elapsed
    }

    /// Close out one elapsed booking: checked-in stays complete, the rest expire.
    pub async fn expire_booking(&self, id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        let _gate = self.wal_gate.read().await;
        let (place_id, mut guard) = self.resolve_entity_write(&id).await?;
        let system = Principal::admin(super::SYSTEM_ACTOR);
        guarded(&guard, &system, id, Transition::Elapse, now)?;

        let event = Event::BookingElapsed { id, place_id, at: now };
        self.persist_and_apply(place_id, &mut guard, &event).await?;
        committed(&guard, id)
    }

    /// Run one expiry sweep. Returns the bookings that were closed out.
    pub async fn expire_elapsed(&self, now: Ms) -> Vec<Booking> {
        let mut done = Vec::new();
        for id in self.collect_elapsed_bookings(now) {
            match self.expire_booking(id, now).await {
                Ok(b) => {
                    tracing::info!(booking = %id, status = %b.status, "elapsed booking closed");
                    metrics::counter!(crate::observability::BOOKINGS_SWEPT_TOTAL).increment(1);
                    done.push(b);
                }
                // Cancelled or checked out since collection
                Err(e) => tracing::debug!("sweep skip {id}: {e}"),
            }
        }
        done
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    /// No mutation can run between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.wal_gate.write().await;
        let mut events = Vec::new();

        let places: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for ps in places {
            let guard = ps.read().await;
            events.push(Event::PlaceCreated {
                id: guard.id,
                name: guard.name.clone(),
                pricing: guard.pricing,
            });
            for slot in &guard.slots {
                events.push(Event::SlotAdded {
                    id: slot.id,
                    place_id: guard.id,
                    label: slot.label.clone(),
                    pricing: slot.pricing,
                });
                if slot.operator_status != OperatorStatus::InService {
                    events.push(Event::SlotStatusSet {
                        id: slot.id,
                        place_id: guard.id,
                        status: slot.operator_status,
                    });
                }
                for b in &slot.bookings {
                    events.push(Event::BookingCreated { booking: b.clone() });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
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
