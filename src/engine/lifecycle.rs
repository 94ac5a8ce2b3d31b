//! Booking lifecycle: which transitions a booking accepts at a given instant.
//!
//! Everything here is a pure function of `(booking, now)`, so the engine can
//! re-evaluate guards under the place write lock right before committing.

use crate::model::*;

/// A requested lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<'a> {
    ConfirmPayment { transaction_id: Option<&'a str> },
    Cancel,
    Modify,
    CheckIn,
    CheckOut,
    Elapse,
}

/// Outcome of a permitted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Commit; the booking ends up in this status.
    Apply(BookingStatus),
    /// Already done by an earlier identical request. Return the booking as is.
    Noop,
}

pub fn is_elapsed(b: &Booking, now: Ms) -> bool {
    now >= b.span.end
}

pub fn has_started(b: &Booking, now: Ms) -> bool {
    now >= b.span.start
}

pub fn duration_hours(b: &Booking) -> f64 {
    b.span.duration_hours()
}

/// Cancellable / modifiable: live, not checked in and not yet started.
pub fn can_change(b: &Booking, now: Ms) -> bool {
    b.is_live() && b.check_in.is_none() && !has_started(b, now)
}

pub fn evaluate(b: &Booking, t: Transition<'_>, now: Ms) -> Result<Step, &'static str> {
    use BookingStatus::*;
    match (t, b.status) {
        (Transition::ConfirmPayment { .. }, Pending) => {
            if is_elapsed(b, now) {
                return Err("booking interval has elapsed");
            }
            Ok(Step::Apply(Confirmed))
        }
        (Transition::ConfirmPayment { transaction_id }, Confirmed) => {
            if transaction_id.is_some() && transaction_id == b.payment.transaction_id.as_deref() {
                Ok(Step::Noop)
            } else {
                Err("booking is already paid")
            }
        }
        (Transition::Cancel, Cancelled) => Ok(Step::Noop),
        (Transition::Cancel, Pending | Confirmed) => {
            if b.check_in.is_some() {
                return Err("booking is checked in");
            }
            if has_started(b, now) {
                return Err("booking has already started");
            }
            Ok(Step::Apply(Cancelled))
        }
        (Transition::Modify, Pending | Confirmed) => {
            if b.check_in.is_some() {
                return Err("booking is checked in");
            }
            if has_started(b, now) {
                return Err("booking has already started");
            }
            Ok(Step::Apply(b.status))
        }
        (Transition::CheckIn, Confirmed) => {
            if b.check_in.is_some() {
                return Ok(Step::Noop);
            }
            if is_elapsed(b, now) {
                return Err("booking interval has elapsed");
            }
            Ok(Step::Apply(Confirmed))
        }
        (Transition::CheckIn, Pending) => Err("booking is not paid"),
        (Transition::CheckOut, Completed) if b.check_out.is_some() => Ok(Step::Noop),
        (Transition::CheckOut, Confirmed) => {
            if b.check_in.is_none() {
                return Err("booking is not checked in");
            }
            Ok(Step::Apply(Completed))
        }
        (Transition::CheckOut, Pending) => Err("booking is not paid"),
        (Transition::Elapse, Pending | Confirmed) => {
            if !is_elapsed(b, now) {
                return Err("booking interval has not elapsed");
            }
            Ok(Step::Apply(elapsed_outcome(b)))
        }
        _ => Err("booking is in a terminal state"),
    }
}

/// Where a live booking lands when its interval runs out.
pub fn elapsed_outcome(b: &Booking) -> BookingStatus {
    if b.status == BookingStatus::Confirmed && b.check_in.is_some() {
        BookingStatus::Completed
    } else {
        BookingStatus::Expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn booking(status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: "u".into(),
            place_id: Ulid::new(),
            slot_id: Ulid::new(),
            span: Span::new(1_000, 2_000),
            status,
            amount: 10.0,
            vehicle: Vehicle::plate("X"),
            payment: Payment::unpaid(),
            check_in: None,
            check_out: None,
            cancellation: None,
            created_at: 0,
        }
    }

    fn stamp(t: Ms) -> Option<Stamp> {
        Some(Stamp { time: t, by: "u".into() })
    }

    #[test]
    fn pending_to_confirmed_on_payment() {
        let b = booking(BookingStatus::Pending);
        let t = Transition::ConfirmPayment { transaction_id: Some("tx1") };
        assert_eq!(evaluate(&b, t, 500), Ok(Step::Apply(BookingStatus::Confirmed)));
        assert!(evaluate(&b, t, 2_000).is_err());
    }

    #[test]
    fn repeated_payment_with_same_transaction_is_noop() {
        let mut b = booking(BookingStatus::Confirmed);
        b.payment.transaction_id = Some("tx1".into());
        let same = Transition::ConfirmPayment { transaction_id: Some("tx1") };
        let other = Transition::ConfirmPayment { transaction_id: Some("tx2") };
        assert_eq!(evaluate(&b, same, 500), Ok(Step::Noop));
        assert!(evaluate(&b, other, 500).is_err());
        assert!(evaluate(&b, Transition::ConfirmPayment { transaction_id: None }, 500).is_err());
    }

    #[test]
    fn cancel_only_before_start() {
        for status in [BookingStatus::Pending, BookingStatus::Confirmed] {
            let b = booking(status);
            assert_eq!(evaluate(&b, Transition::Cancel, 999), Ok(Step::Apply(BookingStatus::Cancelled)));
            assert!(evaluate(&b, Transition::Cancel, 1_000).is_err());
            assert!(evaluate(&b, Transition::Cancel, 1_500).is_err());
        }
    }

    #[test]
    fn checked_in_booking_cannot_be_cancelled_or_moved() {
        let mut b = booking(BookingStatus::Confirmed);
        b.check_in = stamp(900);
        assert!(evaluate(&b, Transition::Cancel, 950).is_err());
        assert!(evaluate(&b, Transition::Modify, 950).is_err());
        assert!(!can_change(&b, 950));
        assert_eq!(evaluate(&b, Transition::CheckOut, 950), Ok(Step::Apply(BookingStatus::Completed)));
    }

    #[test]
    fn cancel_is_idempotent() {
        let b = booking(BookingStatus::Cancelled);
        assert_eq!(evaluate(&b, Transition::Cancel, 5_000), Ok(Step::Noop));
    }

    #[test]
    fn terminal_states_reject_everything_else() {
        for status in [BookingStatus::Completed, BookingStatus::Expired] {
            let b = booking(status);
            assert!(evaluate(&b, Transition::Cancel, 0).is_err());
            assert!(evaluate(&b, Transition::Modify, 0).is_err());
            assert!(evaluate(&b, Transition::CheckIn, 0).is_err());
            assert!(evaluate(&b, Transition::Elapse, 5_000).is_err());
        }
    }

    #[test]
    fn check_in_requires_payment() {
        let b = booking(BookingStatus::Pending);
        assert!(evaluate(&b, Transition::CheckIn, 1_200).is_err());
        let b = booking(BookingStatus::Confirmed);
        assert_eq!(evaluate(&b, Transition::CheckIn, 1_200), Ok(Step::Apply(BookingStatus::Confirmed)));
        assert!(evaluate(&b, Transition::CheckIn, 2_000).is_err());
    }

    #[test]
    fn check_in_twice_is_noop() {
        let mut b = booking(BookingStatus::Confirmed);
        b.check_in = stamp(1_100);
        assert_eq!(evaluate(&b, Transition::CheckIn, 1_200), Ok(Step::Noop));
    }

    #[test]
    fn check_out_requires_check_in_and_is_idempotent() {
        let mut b = booking(BookingStatus::Confirmed);
        assert!(evaluate(&b, Transition::CheckOut, 1_500).is_err());
        b.check_in = stamp(1_100);
        assert_eq!(evaluate(&b, Transition::CheckOut, 1_500), Ok(Step::Apply(BookingStatus::Completed)));

        b.status = BookingStatus::Completed;
        b.check_out = stamp(1_500);
        assert_eq!(evaluate(&b, Transition::CheckOut, 1_600), Ok(Step::Noop));
    }

    #[test]
    fn elapse_outcome_depends_on_check_in() {
        let b = booking(BookingStatus::Pending);
        assert!(evaluate(&b, Transition::Elapse, 1_999).is_err());
        assert_eq!(evaluate(&b, Transition::Elapse, 2_000), Ok(Step::Apply(BookingStatus::Expired)));

        let mut b = booking(BookingStatus::Confirmed);
        assert_eq!(evaluate(&b, Transition::Elapse, 2_000), Ok(Step::Apply(BookingStatus::Expired)));
        b.check_in = stamp(1_100);
        assert_eq!(evaluate(&b, Transition::Elapse, 2_000), Ok(Step::Apply(BookingStatus::Completed)));
    }

    #[test]
    fn derived_views() {
        let b = booking(BookingStatus::Pending);
        assert!(can_change(&b, 999));
        assert!(!can_change(&b, 1_000));
        assert!(!is_elapsed(&b, 1_999));
        assert!(is_elapsed(&b, 2_000));
        assert_eq!(duration_hours(&b), 1_000.0 / HOUR_MS as f64);
    }
}
