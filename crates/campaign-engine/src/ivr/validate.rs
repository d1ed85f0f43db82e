//! Captured-value validation rules.
//!
//! `day_laborable` is evaluated against the month current at capture
//! time: the promised day must fall on a weekday of that calendar
//! month.

use chrono::{Datelike, NaiveDate, Weekday};

use crate::models::StepValidation;

/// Validate a captured value under the step's rule.
///
/// `today` is the capture date; only `day_laborable` consults it.
pub fn validate(validation: StepValidation, value: &str, today: NaiveDate) -> bool {
    match validation {
        StepValidation::None => true,
        StepValidation::Day1To28 => parse_day(value).is_some(),
        StepValidation::DayLaborable => match parse_day(value) {
            Some(day) => NaiveDate::from_ymd_opt(today.year(), today.month(), day)
                .map(|date| !matches!(date.weekday(), Weekday::Sat | Weekday::Sun))
                .unwrap_or(false),
            None => false,
        },
    }
}

/// Parse a day-of-month capture, bounded to 1..=28
pub fn parse_day(value: &str) -> Option<u32> {
    let day: u32 = value.parse().ok()?;
    (1..=28).contains(&day).then_some(day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn none_accepts_anything() {
        assert!(validate(StepValidation::None, "whatever", date(2026, 3, 10)));
    }

    #[test]
    fn day_1_28_bounds() {
        let today = date(2026, 3, 10);
        assert!(validate(StepValidation::Day1To28, "1", today));
        assert!(validate(StepValidation::Day1To28, "28", today));
        assert!(!validate(StepValidation::Day1To28, "0", today));
        assert!(!validate(StepValidation::Day1To28, "29", today));
        assert!(!validate(StepValidation::Day1To28, "15x", today));
        assert!(!validate(StepValidation::Day1To28, "", today));
    }

    #[test]
    fn laborable_checks_weekday_of_current_month() {
        // March 2026: the 7th is a Saturday, the 9th a Monday
        let today = date(2026, 3, 20);
        assert!(validate(StepValidation::DayLaborable, "9", today));
        assert!(!validate(StepValidation::DayLaborable, "7", today));
        assert!(!validate(StepValidation::DayLaborable, "8", today));
    }

    #[test]
    fn laborable_uses_month_of_capture() {
        // Day 1 is a Sunday in March 2026 but a Wednesday in April 2026
        assert!(!validate(StepValidation::DayLaborable, "1", date(2026, 3, 31)));
        assert!(validate(StepValidation::DayLaborable, "1", date(2026, 4, 1)));
    }
}
