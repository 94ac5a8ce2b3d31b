use crate::model::*;

// ── Free windows ──────────────────────────────────────────────────

/// Live booking spans on a slot, clamped to `query`, sorted and merged.
fn busy_spans(slot: &SlotState, query: &Span) -> Vec<Span> {
    let mut busy: Vec<Span> = slot
        .overlapping(query)
        .filter(|b| b.is_live())
        .map(|b| Span::new(b.span.start.max(query.start), b.span.end.min(query.end)))
        .collect();
    busy.sort_by_key(|s| s.start);
    merge_overlapping(&busy)
}

/// Sub-intervals of `query` in which `slot` could take a booking.
/// A slot out of service has no free windows.
pub fn slot_free_windows(slot: &SlotState, query: &Span) -> Vec<Span> {
    if !slot.in_service() {
        return Vec::new();
    }
    subtract_intervals(&[*query], &busy_spans(slot, query))
}

/// Sub-intervals of `query` in which at least one in-service slot of the
/// place is free.
pub fn place_free_windows(place: &PlaceState, query: &Span) -> Vec<Span> {
    let in_service: Vec<&SlotState> = place.slots.iter().filter(|s| s.in_service()).collect();
    if in_service.is_empty() {
        return Vec::new();
    }
    // Bookings on one slot never overlap, so per-slot busy spans count one each.
    let mut allocs: Vec<Span> = in_service
        .iter()
        .flat_map(|s| busy_spans(s, query))
        .collect();
    allocs.sort_by_key(|s| s.start);
    let saturated = compute_saturated_spans(&allocs, in_service.len() as u32);
    subtract_intervals(&[*query], &saturated)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Sweep-line algorithm: find time ranges where allocation count >= capacity.
/// Returns sorted, merged spans representing fully-saturated time ranges.
pub fn compute_saturated_spans(allocs: &[Span], capacity: u32) -> Vec<Span> {
    if allocs.is_empty() || capacity == 0 {
        return Vec::new();
    }
    if capacity == 1 {
        return merge_overlapping(allocs);
    }

    // +1 at start, -1 at end; ends sort before starts at the same instant
    let mut events: Vec<(Ms, i32)> = Vec::with_capacity(allocs.len() * 2);
    for a in allocs {
        events.push((a.start, 1));
        events.push((a.end, -1));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result: Vec<Span> = Vec::new();
    let mut count: i64 = 0;
    let mut saturated_start: Option<Ms> = None;

    for (time, delta) in &events {
        count += *delta as i64;

        if count >= capacity as i64 && saturated_start.is_none() {
            saturated_start = Some(*time);
        } else if count < capacity as i64
            && let Some(start) = saturated_start.take()
            && *time > start {
                result.push(Span::new(start, *time));
            }
    }

    merge_overlapping(&result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = HOUR_MS;

    fn slot_with(spans: &[(Ms, Ms, BookingStatus)]) -> SlotState {
        let mut slot = SlotState::new(Ulid::new(), Ulid::new(), None, Pricing::hourly(1.0));
        for &(start, end, status) in spans {
            slot.insert_booking(Booking {
                id: Ulid::new(),
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
        slot
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Span::new(100, 150), Span::new(200, 300)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![Span::new(100, 200), Span::new(400, 500), Span::new(800, 900)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![Span::new(100, 300), Span::new(200, 400), Span::new(500, 600)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 400), Span::new(500, 600)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 300)]);
    }

    // ── slot windows ─────────────────────────────────────

    #[test]
    fn slot_windows_skip_live_bookings_only() {
        let slot = slot_with(&[
            (10 * H, 12 * H, BookingStatus::Confirmed),
            (14 * H, 15 * H, BookingStatus::Cancelled),
            (16 * H, 17 * H, BookingStatus::Pending),
        ]);
        let free = slot_free_windows(&slot, &Span::new(8 * H, 18 * H));
        assert_eq!(
            free,
            vec![Span::new(8 * H, 10 * H), Span::new(12 * H, 16 * H), Span::new(17 * H, 18 * H)]
        );
    }

    #[test]
    fn slot_windows_clamp_to_query() {
        let slot = slot_with(&[(6 * H, 9 * H, BookingStatus::Pending)]);
        let free = slot_free_windows(&slot, &Span::new(8 * H, 10 * H));
        assert_eq!(free, vec![Span::new(9 * H, 10 * H)]);
    }

    #[test]
    fn slot_windows_empty_when_out_of_service() {
        let mut slot = slot_with(&[]);
        slot.operator_status = OperatorStatus::Maintenance;
        assert!(slot_free_windows(&slot, &Span::new(0, H)).is_empty());
    }

    // ── place windows ────────────────────────────────────

    #[test]
    fn place_windows_need_one_free_slot() {
        let mut place = PlaceState::new(Ulid::new(), None, Pricing::hourly(1.0));
        place.slots.push(slot_with(&[(10 * H, 12 * H, BookingStatus::Pending)]));
        place.slots.push(slot_with(&[(11 * H, 13 * H, BookingStatus::Confirmed)]));
        let free = place_free_windows(&place, &Span::new(9 * H, 14 * H));
        // Both slots busy only during [11, 12).
        assert_eq!(free, vec![Span::new(9 * H, 11 * H), Span::new(12 * H, 14 * H)]);
    }

    #[test]
    fn place_windows_ignore_disabled_slots() {
        let mut place = PlaceState::new(Ulid::new(), None, Pricing::hourly(1.0));
        place.slots.push(slot_with(&[(10 * H, 12 * H, BookingStatus::Pending)]));
        let mut down = slot_with(&[]);
        down.operator_status = OperatorStatus::OutOfService;
        place.slots.push(down);
        let free = place_free_windows(&place, &Span::new(9 * H, 13 * H));
        assert_eq!(free, vec![Span::new(9 * H, 10 * H), Span::new(12 * H, 13 * H)]);
    }

    // ── compute_saturated_spans ────────────────────────────

    #[test]
    fn saturated_spans_basic() {
        let allocs = vec![Span::new(0, 100), Span::new(50, 150)];
        assert_eq!(compute_saturated_spans(&allocs, 2), vec![Span::new(50, 100)]);
    }

    #[test]
    fn saturated_spans_no_overlap() {
        let allocs = vec![Span::new(0, 100), Span::new(200, 300)];
        assert!(compute_saturated_spans(&allocs, 2).is_empty());
    }

    #[test]
    fn saturated_spans_capacity_one() {
        let allocs = vec![Span::new(0, 100), Span::new(200, 300)];
        assert_eq!(
            compute_saturated_spans(&allocs, 1),
            vec![Span::new(0, 100), Span::new(200, 300)]
        );
    }

    #[test]
    fn saturated_spans_back_to_back_handoff() {
        // Slot A busy [0,100), slot B busy [0,50) then [50,100): always both busy.
        let allocs = vec![Span::new(0, 100), Span::new(0, 50), Span::new(50, 100)];
        assert_eq!(compute_saturated_spans(&allocs, 2), vec![Span::new(0, 100)]);
    }
}
