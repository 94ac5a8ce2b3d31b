use crate::limits::MAX_RATE;
use crate::model::{Pricing, Span};

use super::EngineError;

const HOURS_PER_DAY: f64 = 24.0;

/// Price for a stay of `duration_hours`.
///
/// Stays of a full day or longer are billed per started day when a daily rate
/// exists; everything else is billed per fractional hour. Non-positive
/// durations cost nothing; callers reject them before pricing.
pub fn price(duration_hours: f64, pricing: &Pricing) -> f64 {
    if duration_hours.is_nan() || duration_hours <= 0.0 {
        return 0.0;
    }
    match pricing.daily_rate {
        Some(daily) if duration_hours >= HOURS_PER_DAY => {
            (duration_hours / HOURS_PER_DAY).ceil() * daily
        }
        _ => duration_hours * pricing.hourly_rate,
    }
}

pub fn price_span(span: &Span, pricing: &Pricing) -> f64 {
    price(span.duration_hours(), pricing)
}

pub(crate) fn validate_pricing(pricing: &Pricing) -> Result<(), EngineError> {
    let ok = |r: f64| r.is_finite() && (0.0..=MAX_RATE).contains(&r);
    if !ok(pricing.hourly_rate) {
        return Err(EngineError::Validation("hourly rate must be between 0 and MAX_RATE"));
    }
    if let Some(daily) = pricing.daily_rate
        && !ok(daily) {
            return Err(EngineError::Validation("daily rate must be between 0 and MAX_RATE"));
        }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HOUR_MS;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn hourly_under_a_day() {
        let p = Pricing::with_daily(5.0, 100.0);
        assert!(close(price(23.99, &p), 23.99 * 5.0));
    }

    #[test]
    fn exactly_one_day_uses_daily_rate() {
        let p = Pricing::with_daily(5.0, 100.0);
        assert!(close(price(24.0, &p), 100.0));
    }

    #[test]
    fn partial_second_day_rounds_up() {
        let p = Pricing::with_daily(5.0, 100.0);
        assert!(close(price(25.0, &p), 200.0));
        assert!(close(price(48.0, &p), 200.0));
        assert!(close(price(48.5, &p), 300.0));
    }

    #[test]
    fn no_daily_rate_bills_hours() {
        let p = Pricing::hourly(2.5);
        assert!(close(price(30.0, &p), 75.0));
    }

    #[test]
    fn non_positive_duration_is_free() {
        let p = Pricing::hourly(2.5);
        assert_eq!(price(0.0, &p), 0.0);
        assert_eq!(price(-3.0, &p), 0.0);
        assert_eq!(price(f64::NAN, &p), 0.0);
    }

    #[test]
    fn span_price_keeps_fractional_hours() {
        let p = Pricing::hourly(4.0);
        let span = Span::new(0, HOUR_MS + HOUR_MS / 4);
        assert!(close(price_span(&span, &p), 5.0));
    }

    #[test]
    fn pricing_validation() {
        assert!(validate_pricing(&Pricing::hourly(0.0)).is_ok());
        assert!(validate_pricing(&Pricing::hourly(-1.0)).is_err());
        assert!(validate_pricing(&Pricing::hourly(f64::INFINITY)).is_err());
        assert!(validate_pricing(&Pricing::with_daily(1.0, -5.0)).is_err());
    }
}
