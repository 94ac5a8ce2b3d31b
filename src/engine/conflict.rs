use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::InvalidInterval("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// First live booking on `slot` overlapping `candidate`, skipping `exclude`.
pub fn find_conflict(slot: &SlotState, candidate: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    slot.overlapping(candidate)
        .filter(|b| b.is_live())
        .find(|b| Some(b.id) != exclude)
        .map(|b| b.id)
}

pub fn has_conflict(slot: &SlotState, candidate: &Span, exclude: Option<Ulid>) -> bool {
    find_conflict(slot, candidate, exclude).is_some()
}

pub(crate) fn check_no_conflict(
    slot: &SlotState,
    candidate: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(slot, candidate, exclude) {
        Some(id) => Err(EngineError::BookingConflict(id)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_with(bookings: &[(Ms, Ms, BookingStatus)]) -> (SlotState, Vec<Ulid>) {
        let mut slot = SlotState::new(Ulid::new(), Ulid::new(), None, Pricing::hourly(1.0));
        let mut ids = Vec::new();
        for &(start, end, status) in bookings {
            let id = Ulid::new();
            ids.push(id);
            slot.insert_booking(Booking {
                id,
                user_id: "u".into(),
                place_id: slot.place_id,
                slot_id: slot.id,
                span: Span::new(start, end),
                status,
                amount: 0.0,
                vehicle: Vehicle::plate("X"),
                payment: Payment::unpaid(),
                check_in: None,
                check_out: None,
                cancellation: None,
                created_at: 0,
            });
        }
        (slot, ids)
    }

    #[test]
    fn overlap_is_conflict() {
        let (slot, ids) = slot_with(&[(10, 12, BookingStatus::Pending)]);
        assert_eq!(find_conflict(&slot, &Span::new(11, 13), None), Some(ids[0]));
        assert!(has_conflict(&slot, &Span::new(9, 11), None));
        assert!(has_conflict(&slot, &Span::new(9, 13), None));
    }

    #[test]
    fn touching_endpoints_do_not_conflict() {
        let (slot, _) = slot_with(&[(10, 12, BookingStatus::Confirmed)]);
        assert!(!has_conflict(&slot, &Span::new(12, 14), None));
        assert!(!has_conflict(&slot, &Span::new(8, 10), None));
    }

    #[test]
    fn terminal_bookings_are_ignored() {
        let (slot, _) = slot_with(&[
            (10, 12, BookingStatus::Cancelled),
            (10, 12, BookingStatus::Completed),
            (10, 12, BookingStatus::Expired),
        ]);
        assert!(!has_conflict(&slot, &Span::new(10, 12), None));
    }

    #[test]
    fn excluded_booking_is_skipped() {
        let (slot, ids) = slot_with(&[(10, 12, BookingStatus::Pending), (14, 16, BookingStatus::Pending)]);
        // Moving the first booking within its own window is fine...
        assert!(!has_conflict(&slot, &Span::new(11, 13), Some(ids[0])));
        // ...but not onto the second.
        assert_eq!(find_conflict(&slot, &Span::new(11, 15), Some(ids[0])), Some(ids[1]));
    }

    #[test]
    fn check_no_conflict_names_the_blocker() {
        let (slot, ids) = slot_with(&[(10, 12, BookingStatus::Pending)]);
        match check_no_conflict(&slot, &Span::new(11, 12), None) {
            Err(EngineError::BookingConflict(id)) => assert_eq!(id, ids[0]),
            other => panic!("expected BookingConflict, got {other:?}"),
        }
    }

    #[test]
    fn validate_span_rejects_inverted_and_empty() {
        let base = crate::limits::MIN_VALID_TIMESTAMP_MS;
        assert!(matches!(
            validate_span(&Span { start: base + 10, end: base + 10 }),
            Err(EngineError::InvalidInterval(_))
        ));
        assert!(matches!(
            validate_span(&Span { start: base + 10, end: base + 5 }),
            Err(EngineError::InvalidInterval(_))
        ));
        assert!(validate_span(&Span::new(base, base + HOUR_MS)).is_ok());
    }

    #[test]
    fn validate_span_limits() {
        use crate::limits::*;
        assert!(matches!(
            validate_span(&Span::new(0, HOUR_MS)),
            Err(EngineError::LimitExceeded(_))
        ));
        let start = MIN_VALID_TIMESTAMP_MS;
        assert!(matches!(
            validate_span(&Span::new(start, start + MAX_SPAN_DURATION_MS + 1)),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
