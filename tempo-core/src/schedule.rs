//! Next-due computation for trigger schedules.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tempo_model::ScheduleSpec;

use crate::error::{EngineError, Result};

/// Parses a cron expression, accepting the classic 5-field form by
/// prefixing a zero seconds field.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|err| {
        EngineError::InvalidSchedule(format!("cron {expression:?}: {err}"))
    })
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>().map_err(|err| {
        EngineError::InvalidSchedule(format!("timezone {name:?}: {err}"))
    })
}

/// Validates a schedule without computing anything.
pub fn validate(spec: &ScheduleSpec) -> Result<()> {
    match spec {
        ScheduleSpec::Cron {
            expression,
            timezone,
        } => {
            parse_cron(expression)?;
            parse_timezone(timezone)?;
            Ok(())
        }
        ScheduleSpec::Interval { every, .. } if *every == 0 => Err(
            EngineError::InvalidSchedule("interval must be greater than zero".into()),
        ),
        _ => Ok(()),
    }
}

/// First due time for a recurring trigger that has never fired.
pub fn initial_due(
    spec: &ScheduleSpec,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    next_due_after(spec, now, now)
}

/// Next due time strictly after both `anchor` and `now`.
///
/// `anchor` is the due time of the firing that just happened. Interval
/// schedules step forward from it in whole intervals, so completion time
/// never shifts the grid, and firings missed while the engine was down are
/// skipped rather than replayed.
pub fn next_due_after(
    spec: &ScheduleSpec,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match spec {
        ScheduleSpec::Interval { .. } => {
            let step = spec.interval().unwrap_or_default();
            let step_ms = i64::try_from(step.as_millis()).unwrap_or(i64::MAX);
            if step_ms <= 0 {
                return Err(EngineError::InvalidSchedule(
                    "interval must be greater than zero".into(),
                ));
            }
            let elapsed_ms = (now - anchor).num_milliseconds();
            let steps = if elapsed_ms < 0 {
                1
            } else {
                elapsed_ms / step_ms + 1
            };
            let offset = chrono::Duration::milliseconds(
                steps.saturating_mul(step_ms),
            );
            anchor.checked_add_signed(offset).map(Some).ok_or_else(|| {
                EngineError::InvalidSchedule("next due time overflows".into())
            })
        }
        ScheduleSpec::Cron {
            expression,
            timezone,
        } => {
            let schedule = parse_cron(expression)?;
            let tz = parse_timezone(timezone)?;
            let base = anchor.max(now).with_timezone(&tz);
            Ok(schedule.after(&base).next().map(|at| at.with_timezone(&Utc)))
        }
        ScheduleSpec::Event | ScheduleSpec::Manual => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempo_model::IntervalUnit;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, m, s).unwrap()
    }

    fn every_minute() -> ScheduleSpec {
        ScheduleSpec::Interval {
            every: 60,
            unit: IntervalUnit::Seconds,
        }
    }

    #[test]
    fn interval_advances_from_anchor_not_completion() {
        let anchor = at(10, 0, 0);
        let completed = at(10, 0, 10);
        let next = next_due_after(&every_minute(), anchor, completed)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(10, 1, 0));
    }

    #[test]
    fn interval_skips_missed_firings_without_catch_up() {
        let anchor = at(10, 0, 0);
        // Engine was down for ~2.5 minutes.
        let now = at(10, 2, 30);
        let next = next_due_after(&every_minute(), anchor, now)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(10, 3, 0));
    }

    #[test]
    fn interval_sequence_is_strictly_increasing() {
        let mut due = at(0, 0, 0);
        for _ in 0..50 {
            let next = next_due_after(&every_minute(), due, due).unwrap().unwrap();
            assert!(next > due);
            due = next;
        }
        assert_eq!(due, at(0, 50, 0));
    }

    #[test]
    fn cron_in_timezone() {
        let spec = ScheduleSpec::Cron {
            expression: "0 9 * * *".into(),
            timezone: "Europe/Berlin".into(),
        };
        // 2025-03-01 is CET (UTC+1), so 09:00 local is 08:00 UTC.
        let next = next_due_after(&spec, at(7, 0, 0), at(7, 0, 0))
            .unwrap()
            .unwrap();
        assert_eq!(next, at(8, 0, 0));
    }

    #[test]
    fn cron_uses_later_of_anchor_and_now() {
        let spec = ScheduleSpec::Cron {
            expression: "0 */15 * * * *".into(),
            timezone: "UTC".into(),
        };
        let next = next_due_after(&spec, at(10, 0, 0), at(10, 20, 0))
            .unwrap()
            .unwrap();
        assert_eq!(next, at(10, 30, 0));
    }

    #[test]
    fn event_and_manual_have_no_due_time() {
        assert_eq!(
            next_due_after(&ScheduleSpec::Event, at(1, 0, 0), at(1, 0, 0))
                .unwrap(),
            None
        );
        assert_eq!(
            initial_due(&ScheduleSpec::Manual, at(1, 0, 0)).unwrap(),
            None
        );
    }

    #[test]
    fn invalid_specs_rejected() {
        assert!(
            validate(&ScheduleSpec::Cron {
                expression: "not a cron".into(),
                timezone: "UTC".into(),
            })
            .is_err()
        );
        assert!(
            validate(&ScheduleSpec::Cron {
                expression: "* * * * *".into(),
                timezone: "Mars/Olympus".into(),
            })
            .is_err()
        );
        assert!(
            validate(&ScheduleSpec::Interval {
                every: 0,
                unit: IntervalUnit::Minutes,
            })
            .is_err()
        );
    }
}
