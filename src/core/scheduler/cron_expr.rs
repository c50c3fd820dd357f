use chrono::{DateTime, Duration, Timelike, Utc};
use cron::Schedule;
use std::str::FromStr;

use super::ScheduleError;

/// Parse a cron expression in UTC.
///
/// Five-field input (`min hour dom mon dow`, Sunday as 0 or 7) is translated
/// to the seconds-first dialect the `cron` crate expects, where Sunday is 1.
/// Six- and seven-field input is passed through unchanged.
pub fn parse_schedule(expr: &str) -> Result<Schedule, ScheduleError> {
    let translated = translate(expr)?;
    Schedule::from_str(&translated).map_err(|e| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

pub fn translate(expr: &str) -> Result<String, ScheduleError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = translate_day_of_week(fields[4]).ok_or_else(|| ScheduleError::InvalidCron {
                expr: expr.to_string(),
                reason: format!("bad day-of-week field '{}'", fields[4]),
            })?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason: format!("expected 5 fields, found {}", n),
        }),
    }
}

fn translate_day_of_week(field: &str) -> Option<String> {
    let parts: Option<Vec<String>> = field.split(',').map(translate_dow_item).collect();
    Some(parts?.join(","))
}

fn translate_dow_item(item: &str) -> Option<String> {
    let (base, step) = match item.split_once('/') {
        Some((b, s)) => (b, Some(s)),
        None => (item, None),
    };
    let suffix = step.map(|s| format!("/{}", s)).unwrap_or_default();

    if base == "*" || base == "?" {
        return Some(format!("{}{}", base, suffix));
    }

    if let Some((lo, hi)) = base.split_once('-') {
        return match (numeric_dow(lo), numeric_dow(hi)) {
            (Some(lo), Some(hi)) => {
                if lo > hi {
                    return None;
                }
                // "5-7" is Friday through Sunday; Sunday wraps to 1.
                if hi == 7 && lo > 0 && step.is_none() {
                    return Some(if lo == 7 {
                        "1".to_string()
                    } else {
                        format!("{}-7,1", lo + 1)
                    });
                }
                Some(format!("{}-{}{}", lo + 1, (hi + 1).min(7), suffix))
            }
            (None, None) => Some(format!("{}{}", base, suffix)),
            _ => None,
        };
    }

    match numeric_dow(base) {
        Some(n) => Some(format!("{}{}", n % 7 + 1, suffix)),
        None if base.chars().all(|c| c.is_ascii_alphabetic()) => Some(format!("{}{}", base, suffix)),
        None => None,
    }
}

fn numeric_dow(raw: &str) -> Option<u32> {
    raw.parse::<u32>().ok().filter(|n| *n <= 7)
}

/// Most recent occurrence at or before `now`.
pub fn previous_occurrence(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let floor = now.with_nanosecond(0).unwrap_or(now);
    schedule
        .after(&(floor + Duration::seconds(1)))
        .rev()
        .find(|t| *t <= now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        raw.parse().unwrap()
    }

    #[test]
    fn five_fields_gain_seconds_and_shift_weekdays() {
        assert_eq!(translate("* * * * *").unwrap(), "0 * * * * *");
        assert_eq!(translate("30 6 * * 1-5").unwrap(), "0 30 6 * * 2-6");
        assert_eq!(translate("0 0 * * 0").unwrap(), "0 0 0 * * 1");
        assert_eq!(translate("0 0 * * 7").unwrap(), "0 0 0 * * 1");
        assert_eq!(translate("0 0 * * 5-7").unwrap(), "0 0 0 * * 6-7,1");
        assert_eq!(translate("0 0 * * MON,FRI").unwrap(), "0 0 0 * * MON,FRI");
        assert_eq!(translate("0 12 * * 0-6").unwrap(), "0 0 12 * * 1-7");
    }

    #[test]
    fn six_fields_pass_through() {
        assert_eq!(translate("0 * * * * *").unwrap(), "0 * * * * *");
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(translate("* * *").is_err());
        assert!(parse_schedule("61 * * * *").is_err());
        assert!(parse_schedule("0 0 * * 9").is_err());
    }

    #[test]
    fn previous_occurrence_is_at_or_before_now() {
        let every_minute = parse_schedule("* * * * *").unwrap();
        assert_eq!(
            previous_occurrence(&every_minute, at("2026-04-01T12:00:30Z")),
            Some(at("2026-04-01T12:00:00Z"))
        );
        assert_eq!(
            previous_occurrence(&every_minute, at("2026-04-01T12:01:00Z")),
            Some(at("2026-04-01T12:01:00Z"))
        );

        let weekdays = parse_schedule("0 9 * * 1-5").unwrap();
        // 2026-04-04 is a Saturday; last fire was Friday 09:00.
        assert_eq!(
            previous_occurrence(&weekdays, at("2026-04-04T10:00:00Z")),
            Some(at("2026-04-03T09:00:00Z"))
        );

        let sunday = parse_schedule("0 8 * * 0").unwrap();
        assert_eq!(
            previous_occurrence(&sunday, at("2026-04-06T00:00:00Z")),
            Some(at("2026-04-05T08:00:00Z"))
        );
    }
}
