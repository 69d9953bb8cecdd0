//! Restricted five-field schedule expressions.
//!
//! Fields, in order: minute (0-59), hour (0-23), day of month (1-31),
//! month (1-12), day of week (0-7, both 0 and 7 are Sunday). Each field is
//! either `*` or a single decimal value. Lists, ranges, steps and names are
//! rejected rather than misread.
//!
//! All evaluation is in UTC. When both day fields are pinned, day of week
//! decides and day of month is ignored.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How far ahead `next_after` searches before giving up.
const HORIZON_DAYS: i64 = 8 * 366;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), found {found}")]
    FieldCount { found: usize },

    #[error("unsupported {field} syntax '{token}': only '*' or a single number is allowed")]
    Unsupported { field: &'static str, token: String },

    #[error("{field} value '{token}' out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        token: String,
        min: u32,
        max: u32,
    },
}

/// A parsed schedule expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScheduleExpression {
    minute: Option<u32>,
    hour: Option<u32>,
    day_of_month: Option<u32>,
    month: Option<u32>,
    /// 0 = Sunday
    day_of_week: Option<u32>,
}

impl ScheduleExpression {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount {
                found: fields.len(),
            });
        }

        Ok(Self {
            minute: parse_field(fields[0], "minute", 0, 59)?,
            hour: parse_field(fields[1], "hour", 0, 23)?,
            day_of_month: parse_field(fields[2], "day-of-month", 1, 31)?,
            month: parse_field(fields[3], "month", 1, 12)?,
            day_of_week: parse_field(fields[4], "day-of-week", 0, 7)?.map(|d| d % 7),
        })
    }

    /// Whether `at` (truncated to the minute) satisfies every pinned field.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.matches_date(at.date_naive())
            && field_matches(self.hour, at.hour())
            && field_matches(self.minute, at.minute())
    }

    /// Earliest whole minute strictly after `after` that matches.
    ///
    /// Returns `None` if nothing matches within eight years (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = truncate_to_minute(after) + Duration::minutes(1);
        let start_date = start.date_naive();
        let start_time = (start.hour(), start.minute());

        for offset in 0..=HORIZON_DAYS {
            let date = start_date.checked_add_signed(Duration::days(offset))?;
            if !self.matches_date(date) {
                continue;
            }

            let earliest = if offset == 0 { start_time } else { (0, 0) };
            if let Some((hour, minute)) = self.first_time_from(earliest) {
                let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
                return Some(Utc.from_utc_datetime(&date.and_time(time)));
            }
        }

        None
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        if !field_matches(self.month, date.month()) {
            return false;
        }
        match (self.day_of_week, self.day_of_month) {
            (Some(dow), _) => date.weekday().num_days_from_sunday() == dow,
            (None, Some(dom)) => date.day() == dom,
            (None, None) => true,
        }
    }

    /// First matching (hour, minute) on a matching day at or after `from`.
    fn first_time_from(&self, from: (u32, u32)) -> Option<(u32, u32)> {
        let hours = candidates(self.hour, 23);
        let minutes = candidates(self.minute, 59);
        for hour in hours {
            if hour < from.0 {
                continue;
            }
            for minute in minutes.clone() {
                if (hour, minute) >= from {
                    return Some((hour, minute));
                }
            }
        }
        None
    }
}

impl fmt::Display for ScheduleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [
            self.minute,
            self.hour,
            self.day_of_month,
            self.month,
            self.day_of_week,
        ];
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match field {
                Some(value) => write!(f, "{value}")?,
                None => f.write_str("*")?,
            }
        }
        Ok(())
    }
}

impl FromStr for ScheduleExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ScheduleExpression {
    type Error = CronError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ScheduleExpression> for String {
    fn from(value: ScheduleExpression) -> Self {
        value.to_string()
    }
}

fn parse_field(
    token: &str,
    field: &'static str,
    min: u32,
    max: u32,
) -> Result<Option<u32>, CronError> {
    if token == "*" {
        return Ok(None);
    }
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CronError::Unsupported {
            field,
            token: token.to_string(),
        });
    }

    let out_of_range = || CronError::OutOfRange {
        field,
        token: token.to_string(),
        min,
        max,
    };
    let value: u32 = token.parse().map_err(|_| out_of_range())?;
    if value < min || value > max {
        return Err(out_of_range());
    }
    Ok(Some(value))
}

fn field_matches(field: Option<u32>, value: u32) -> bool {
    field.is_none_or(|f| f == value)
}

fn candidates(field: Option<u32>, max: u32) -> std::ops::RangeInclusive<u32> {
    match field {
        Some(v) => v..=v,
        None => 0..=max,
    }
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn expr(s: &str) -> ScheduleExpression {
        s.parse().unwrap()
    }

    #[test]
    fn daily_at_two_rolls_to_next_day() {
        assert_eq!(
            expr("0 2 * * *").next_after(at(2024, 1, 1, 10, 0)),
            Some(at(2024, 1, 2, 2, 0))
        );
    }

    #[test]
    fn next_is_strictly_after() {
        let e = expr("30 * * * *");
        assert_eq!(e.next_after(at(2024, 1, 1, 10, 30)), Some(at(2024, 1, 1, 11, 30)));
        assert_eq!(e.next_after(at(2024, 1, 1, 10, 29)), Some(at(2024, 1, 1, 10, 30)));

        let seconds_in = at(2024, 1, 1, 10, 29) + Duration::seconds(59);
        assert_eq!(e.next_after(seconds_in), Some(at(2024, 1, 1, 10, 30)));
    }

    #[test]
    fn every_minute() {
        assert_eq!(
            expr("* * * * *").next_after(at(2024, 12, 31, 23, 59)),
            Some(at(2025, 1, 1, 0, 0))
        );
    }

    #[test]
    fn weekly_on_sunday() {
        // 2024-01-01 is a Monday.
        let sunday = Some(at(2024, 1, 7, 3, 0));
        assert_eq!(expr("0 3 * * 0").next_after(at(2024, 1, 1, 0, 0)), sunday);
        assert_eq!(expr("0 3 * * 7").next_after(at(2024, 1, 1, 0, 0)), sunday);
    }

    #[test]
    fn day_of_week_wins_over_day_of_month() {
        // 15th is ignored; next Friday after Monday 2024-01-01 is the 5th.
        assert_eq!(
            expr("0 9 15 * 5").next_after(at(2024, 1, 1, 0, 0)),
            Some(at(2024, 1, 5, 9, 0))
        );
    }

    #[test]
    fn yearly_and_leap_day() {
        assert_eq!(
            expr("0 0 1 1 *").next_after(at(2024, 6, 1, 0, 0)),
            Some(at(2025, 1, 1, 0, 0))
        );
        assert_eq!(
            expr("0 12 29 2 *").next_after(at(2024, 3, 1, 0, 0)),
            Some(at(2028, 2, 29, 12, 0))
        );
    }

    #[test]
    fn impossible_dates_never_fire() {
        assert_eq!(expr("0 0 30 2 *").next_after(at(2024, 1, 1, 0, 0)), None);
        assert_eq!(expr("0 0 31 4 *").next_after(at(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn rejects_unsupported_syntax() {
        for bad in ["*/5 * * * *", "0 1,2 * * *", "0 9-17 * * *", "0 0 * JAN *", "0 0 * * MON"] {
            assert!(
                matches!(bad.parse::<ScheduleExpression>(), Err(CronError::Unsupported { .. })),
                "{bad} should be unsupported"
            );
        }
    }

    #[test]
    fn rejects_bad_shapes_and_ranges() {
        assert_eq!(
            "0 2 * *".parse::<ScheduleExpression>(),
            Err(CronError::FieldCount { found: 4 })
        );
        assert!(matches!(
            "60 * * * *".parse::<ScheduleExpression>(),
            Err(CronError::OutOfRange { field: "minute", .. })
        ));
        assert!(matches!(
            "0 0 0 * *".parse::<ScheduleExpression>(),
            Err(CronError::OutOfRange { field: "day-of-month", .. })
        ));
        assert!(matches!(
            "0 0 * * 8".parse::<ScheduleExpression>(),
            Err(CronError::OutOfRange { .. })
        ));
    }

    #[test]
    fn display_normalizes_sunday() {
        assert_eq!(expr("0  3 * *   7").to_string(), "0 3 * * 0");
        let json = serde_json::to_string(&expr("15 4 * * *")).unwrap();
        assert_eq!(json, "\"15 4 * * *\"");
        let back: ScheduleExpression = serde_json::from_str(&json).unwrap();
        assert_eq!(back, expr("15 4 * * *"));
        assert!(serde_json::from_str::<ScheduleExpression>("\"*/5 * * * *\"").is_err());
    }

    fn field(min: u32, max: u32) -> impl Strategy<Value = Option<u32>> {
        prop_oneof![Just(None), (min..=max).prop_map(Some)]
    }

    prop_compose! {
        fn expression()(
            minute in field(0, 59),
            hour in field(0, 23),
            day_of_month in field(1, 28),
            month in field(1, 12),
            day_of_week in field(0, 6),
        ) -> ScheduleExpression {
            ScheduleExpression { minute, hour, day_of_month, month, day_of_week }
        }
    }

    fn instant() -> impl Strategy<Value = DateTime<Utc>> {
        // 2000-01-01 .. ~2060, second resolution
        (946_684_800i64..2_840_140_800i64).prop_map(|s| Utc.timestamp_opt(s, 0).unwrap())
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn next_after_is_a_later_matching_minute(e in expression(), t in instant()) {
            // Day of month capped at 28 so every expression fires within a year.
            let next = e.next_after(t).unwrap();
            prop_assert!(next > t);
            prop_assert_eq!(next.second(), 0);
            prop_assert!(e.matches(next));
        }

        #[test]
        fn no_match_is_skipped(minute in 0u32..60, t in instant()) {
            // Hourly expressions: brute-force the hour following `t`.
            let e = ScheduleExpression {
                minute: Some(minute),
                hour: None,
                day_of_month: None,
                month: None,
                day_of_week: None,
            };
            let next = e.next_after(t).unwrap();
            let mut candidate = truncate_to_minute(t) + Duration::minutes(1);
            while candidate < next {
                prop_assert!(!e.matches(candidate));
                candidate += Duration::minutes(1);
            }
        }
    }
}
