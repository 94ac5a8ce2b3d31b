use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{place_free_windows, slot_free_windows};
use super::conflict::{has_conflict, validate_span};
use super::pricing::price_span;
use super::{require_admin, require_owner, Engine, EngineError};

fn query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInterval("start must be before end"));
    }
    if end - start > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(start, end))
}

impl Engine {
    /// All places, ordered by id (ULIDs sort by creation time).
    pub async fn list_places(&self) -> Vec<PlaceInfo> {
        let places: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(places.len());
        for ps in places {
            out.push(PlaceInfo::from_state(&*ps.read().await));
        }
        out.sort_by_key(|p| p.id);
        out
    }

    pub async fn place_info(&self, id: Ulid) -> Result<PlaceInfo, EngineError> {
        let ps = self.get_place(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ps.read().await;
        Ok(PlaceInfo::from_state(&guard))
    }

    /// Slots of a place in creation order.
    pub async fn list_slots(&self, place_id: Ulid) -> Result<Vec<SlotInfo>, EngineError> {
        let ps = self.get_place(&place_id).ok_or(EngineError::NotFound(place_id))?;
        let guard = ps.read().await;
        Ok(guard.slots.iter().map(SlotInfo::from_state).collect())
    }

    pub async fn slot_info(&self, id: Ulid) -> Result<SlotInfo, EngineError> {
        let guard = self.resolve_entity_read(&id).await?;
        guard.slot(&id).map(SlotInfo::from_state).ok_or(EngineError::NotFound(id))
    }

    pub async fn get_booking(&self, principal: &Principal, id: Ulid) -> Result<Booking, EngineError> {
        let guard = self.resolve_entity_read(&id).await?;
        let b = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        require_owner(principal, b)?;
        Ok(b.clone())
    }

    /// Bookings matching `filter`, sorted by start time then id. Non-admins
    /// only ever see their own bookings, whatever the filter says.
    pub async fn list_bookings(
        &self,
        principal: &Principal,
        mut filter: BookingFilter,
        page: Page,
    ) -> Result<Vec<Booking>, EngineError> {
        if page.limit > MAX_PAGE_SIZE {
            return Err(EngineError::LimitExceeded("page size too large"));
        }
        if !principal.is_admin() {
            filter.user_id = Some(principal.user_id.clone());
        }

        let places: Vec<_> = match filter.place_id {
            Some(pid) => self.get_place(&pid).into_iter().collect(),
            None => self.state.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for ps in places {
            let guard = ps.read().await;
            out.extend(guard.bookings().filter(|b| filter.matches(b)).cloned());
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out.into_iter().skip(page.offset).take(page.limit).collect())
    }

    /// Price a prospective stay on a slot. Nothing is reserved.
    pub async fn calculate_price(&self, slot_id: Ulid, span: Span) -> Result<f64, EngineError> {
        validate_span(&span)?;
        let guard = self.resolve_entity_read(&slot_id).await?;
        let slot = guard.slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        Ok(price_span(&span, &slot.pricing))
    }

    /// True iff the slot is in service and no live booking overlaps `span`.
    pub async fn check_availability(&self, slot_id: Ulid, span: Span) -> Result<bool, EngineError> {
        validate_span(&span)?;
        let guard = self.resolve_entity_read(&slot_id).await?;
        let slot = guard.slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        Ok(slot.in_service() && !has_conflict(slot, &span, None))
    }

    /// Free sub-intervals of `[start, end)` on one slot.
    pub async fn slot_availability(
        &self,
        slot_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let query = query_window(start, end)?;
        let guard = self.resolve_entity_read(&slot_id).await?;
        let slot = guard.slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let mut free = slot_free_windows(slot, &query);
        if let Some(min) = min_duration_ms {
            free.retain(|s| s.duration_ms() >= min);
        }
        Ok(free)
    }

    /// Sub-intervals of `[start, end)` in which at least one slot of the place is free.
    pub async fn place_availability(
        &self,
        place_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let query = query_window(start, end)?;
        let ps = self.get_place(&place_id).ok_or(EngineError::NotFound(place_id))?;
        let guard = ps.read().await;
        let mut free = place_free_windows(&guard, &query);
        if let Some(min) = min_duration_ms {
            free.retain(|s| s.duration_ms() >= min);
        }
        Ok(free)
    }

    pub async fn place_report(
        &self,
        principal: &Principal,
        place_id: Ulid,
    ) -> Result<PlaceReport, EngineError> {
        require_admin(principal, place_id)?;
        let ps = self.get_place(&place_id).ok_or(EngineError::NotFound(place_id))?;
        let guard = ps.read().await;

        let mut report = PlaceReport {
            place_id,
            capacity: guard.capacity,
            slots_occupied: guard
                .slots
                .iter()
                .filter(|s| s.status == SlotStatus::Occupied)
                .count() as u32,
            bookings_pending: 0,
            bookings_confirmed: 0,
            bookings_completed: 0,
            bookings_cancelled: 0,
            bookings_expired: 0,
            revenue: 0.0,
            refunds: 0.0,
        };
        for b in guard.bookings() {
            match b.status {
                BookingStatus::Pending => report.bookings_pending += 1,
                BookingStatus::Confirmed => {
                    report.bookings_confirmed += 1;
                    report.revenue += b.amount;
                }
                BookingStatus::Completed => {
                    report.bookings_completed += 1;
                    report.revenue += b.amount;
                }
                BookingStatus::Cancelled => report.bookings_cancelled += 1,
                BookingStatus::Expired => report.bookings_expired += 1,
            }
            if let Some(ref c) = b.cancellation {
                report.refunds += c.refund_amount;
            }
        }
        Ok(report)
    }
}
