//! Pure schedule evaluation. Given a schedule, the last run instant, and a
//! reference time, computes the next instant the schedule is due. Holds no
//! state; the same inputs always produce the same answer.

use crate::models::ScheduleSpec;
use chrono::{DateTime, Datelike, Days, FixedOffset, Months, NaiveDate, Utc};

/// Next instant at which `spec` is due, or `None` if it never fires again.
///
/// Calendar math happens in the fixed-offset reference timezone. A report
/// that has never run is anchored to the current period, so its scheduled
/// instant may already be in the past; callers compare against `now` to
/// decide dueness. The result never decreases as `now` increases.
pub fn next_due(
    spec: &ScheduleSpec,
    last_run_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    match *spec {
        ScheduleSpec::Once => match last_run_at {
            // A one-shot schedule never re-fires once it has run.
            Some(_) => None,
            None => Some(now),
        },
        ScheduleSpec::Daily { hour, minute } => {
            let date = match last_run_at {
                Some(last) => local_date(last, offset).checked_add_days(Days::new(1))?,
                None => local_date(now, offset),
            };
            at_local(date, hour, minute, offset)
        }
        ScheduleSpec::Weekly {
            day_of_week,
            hour,
            minute,
        } => {
            let week_start = match last_run_at {
                Some(last) => {
                    week_start(local_date(last, offset)).checked_add_days(Days::new(7))?
                }
                None => week_start(local_date(now, offset)),
            };
            let date = week_start.checked_add_days(Days::new(u64::from(
                day_of_week.weekday().num_days_from_monday(),
            )))?;
            at_local(date, hour, minute, offset)
        }
        ScheduleSpec::Monthly {
            day_of_month,
            hour,
            minute,
        } => {
            let month_anchor = match last_run_at {
                Some(last) => local_date(last, offset)
                    .with_day(1)?
                    .checked_add_months(Months::new(1))?,
                None => local_date(now, offset).with_day(1)?,
            };
            // A day past the end of the month fires on the month's last day.
            let day = day_of_month.min(days_in_month(month_anchor.year(), month_anchor.month()));
            let date = month_anchor.with_day(day)?;
            at_local(date, hour, minute, offset)
        }
    }
}

fn local_date(instant: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    instant.with_timezone(&offset).date_naive()
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Days::new(u64::from(date.weekday().num_days_from_monday()))
}

fn at_local(date: NaiveDate, hour: u32, minute: u32, offset: FixedOffset) -> Option<DateTime<Utc>> {
    date.and_hms_opt(hour, minute, 0)
        .and_then(|naive| naive.and_local_timezone(offset).single())
        .map(|local| local.with_timezone(&Utc))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

#[cfg(test)]
mod tests {
    use super::{days_in_month, next_due};
    use crate::models::{DayOfWeek, ScheduleSpec};
    use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().expect("valid instant")
    }

    fn no_offset() -> FixedOffset {
        FixedOffset::east_opt(0).expect("valid offset")
    }

    #[test]
    fn once_fires_immediately_then_never_again() {
        let now = utc(2024, 3, 10, 12, 0);
        assert_eq!(
            next_due(&ScheduleSpec::Once, None, now, no_offset()),
            Some(now)
        );
        assert_eq!(
            next_due(&ScheduleSpec::Once, Some(now), now + Duration::days(30), no_offset()),
            None
        );
    }

    #[test]
    fn daily_fires_the_day_after_the_last_run() {
        let spec = ScheduleSpec::Daily { hour: 9, minute: 0 };
        let last = utc(2024, 3, 10, 9, 0);
        let next = next_due(&spec, Some(last), utc(2024, 3, 11, 12, 0), no_offset());
        assert_eq!(next, Some(utc(2024, 3, 11, 9, 0)));
    }

    #[test]
    fn daily_late_run_still_anchors_to_calendar_day() {
        // Last run at 23:30 yesterday; next fire is today at 09:00.
        let spec = ScheduleSpec::Daily { hour: 9, minute: 0 };
        let last = utc(2024, 3, 10, 23, 30);
        let next = next_due(&spec, Some(last), utc(2024, 3, 11, 8, 0), no_offset());
        assert_eq!(next, Some(utc(2024, 3, 11, 9, 0)));
    }

    #[test]
    fn weekly_monday_fires_the_following_monday() {
        // 2024-03-04 is a Monday.
        let spec = ScheduleSpec::Weekly {
            day_of_week: DayOfWeek::Mon,
            hour: 9,
            minute: 0,
        };
        let last = utc(2024, 3, 4, 9, 0);
        let next = next_due(&spec, Some(last), utc(2024, 3, 8, 0, 0), no_offset());
        assert_eq!(next, Some(utc(2024, 3, 11, 9, 0)));
    }

    #[test]
    fn weekly_without_history_anchors_to_current_week() {
        let spec = ScheduleSpec::Weekly {
            day_of_week: DayOfWeek::Mon,
            hour: 9,
            minute: 0,
        };
        // Wednesday 2024-03-06; this week's Monday 09:00 has already passed.
        let next = next_due(&spec, None, utc(2024, 3, 6, 12, 0), no_offset());
        assert_eq!(next, Some(utc(2024, 3, 4, 9, 0)));
    }

    #[test]
    fn monthly_day_past_month_end_clamps_to_last_day() {
        let spec = ScheduleSpec::Monthly {
            day_of_month: 31,
            hour: 8,
            minute: 30,
        };
        let last = utc(2024, 1, 31, 8, 30);
        let next = next_due(&spec, Some(last), utc(2024, 2, 20, 0, 0), no_offset());
        // 2024 is a leap year.
        assert_eq!(next, Some(utc(2024, 2, 29, 8, 30)));
    }

    #[test]
    fn monthly_advances_one_calendar_month() {
        let spec = ScheduleSpec::Monthly {
            day_of_month: 15,
            hour: 6,
            minute: 0,
        };
        let last = utc(2024, 4, 15, 6, 0);
        let next = next_due(&spec, Some(last), utc(2024, 5, 1, 0, 0), no_offset());
        assert_eq!(next, Some(utc(2024, 5, 15, 6, 0)));
    }

    #[test]
    fn evaluation_respects_the_reference_offset() {
        // UTC+05:30: 09:00 local is 03:30 UTC.
        let offset = FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("valid offset");
        let spec = ScheduleSpec::Daily { hour: 9, minute: 0 };
        let last = utc(2024, 3, 10, 3, 30);
        let next = next_due(&spec, Some(last), utc(2024, 3, 11, 12, 0), offset);
        assert_eq!(next, Some(utc(2024, 3, 11, 3, 30)));
    }

    #[test]
    fn next_due_is_deterministic_and_monotonic_in_now() {
        let spec = ScheduleSpec::Daily { hour: 9, minute: 0 };
        let start = utc(2024, 3, 1, 0, 0);
        let mut previous: Option<DateTime<Utc>> = None;
        for hours in 0..96 {
            let now = start + Duration::hours(hours);
            let first = next_due(&spec, None, now, no_offset());
            let second = next_due(&spec, None, now, no_offset());
            assert_eq!(first, second);
            let value = first.expect("daily schedules always have a next instant");
            if let Some(prior) = previous {
                assert!(value >= prior);
            }
            previous = Some(value);
        }
    }

    #[test]
    fn february_lengths() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2024, 12), 31);
    }
}
