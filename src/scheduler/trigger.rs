//! Fire-time arithmetic for job cadences.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};

use crate::errors::{BackupError, Result};
use crate::models::Cadence;

// Enough to walk past any DST gap or repeated hour.
const MAX_CANDIDATES: usize = 64;

/// The first instant strictly after `after` at which a job with this cadence
/// fires, evaluated in `after`'s time zone.
///
/// Hourly jobs fire at minute 0 and ignore `time_of_day`. Weekly jobs fire on
/// Sunday and monthly jobs on the 1st, both at `time_of_day`. A wall-clock
/// time that does not exist locally (DST gap) is skipped; one that exists
/// twice resolves to its earlier occurrence.
pub fn next_fire_after<Tz: TimeZone>(
    cadence: Cadence,
    time_of_day: NaiveTime,
    after: &DateTime<Tz>,
) -> Result<DateTime<Tz>> {
    let tz = after.timezone();
    let mut candidate = first_candidate(cadence, time_of_day, after.naive_local())?;
    for _ in 0..MAX_CANDIDATES {
        if let Some(at) = tz.from_local_datetime(&candidate).earliest() {
            if at > *after {
                return Ok(at);
            }
        }
        candidate = advance(cadence, time_of_day, candidate)?;
    }
    Err(BackupError::config(format!(
        "no {:?} fire time found after {}",
        cadence,
        after.naive_local()
    )))
}

fn first_candidate(cadence: Cadence, time_of_day: NaiveTime, local: NaiveDateTime) -> Result<NaiveDateTime> {
    let date = local.date();
    match cadence {
        Cadence::Hourly => NaiveTime::from_hms_opt(local.hour(), 0, 0)
            .map(|t| date.and_time(t))
            .ok_or_else(|| out_of_range(local)),
        Cadence::Daily => Ok(date.and_time(time_of_day)),
        Cadence::Weekly => {
            let back = i64::from(date.weekday().num_days_from_sunday());
            date.checked_sub_signed(Duration::days(back))
                .map(|sunday| sunday.and_time(time_of_day))
                .ok_or_else(|| out_of_range(local))
        }
        Cadence::Monthly => date
            .with_day(1)
            .map(|first| first.and_time(time_of_day))
            .ok_or_else(|| out_of_range(local)),
    }
}

fn advance(cadence: Cadence, time_of_day: NaiveTime, candidate: NaiveDateTime) -> Result<NaiveDateTime> {
    let next = match cadence {
        Cadence::Hourly => candidate.checked_add_signed(Duration::hours(1)),
        Cadence::Daily => candidate
            .date()
            .checked_add_signed(Duration::days(1))
            .map(|d| d.and_time(time_of_day)),
        Cadence::Weekly => candidate
            .date()
            .checked_add_signed(Duration::days(7))
            .map(|d| d.and_time(time_of_day)),
        Cadence::Monthly => first_of_next_month(candidate.date()).map(|d| d.and_time(time_of_day)),
    };
    next.ok_or_else(|| out_of_range(candidate))
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn out_of_range(at: NaiveDateTime) -> BackupError {
    BackupError::config(format!("fire time after {} is out of range", at))
}

/// How an overdue fire relates to its planned time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lateness {
    /// Late by no more than the grace window.
    OnTime,
    /// Missed by more than the grace window. Every interval missed since is
    /// coalesced into the single run that follows.
    Misfired { missed_by: Duration },
}

pub fn lateness(planned: DateTime<Utc>, now: DateTime<Utc>, grace: Duration) -> Lateness {
    let late_by = now - planned;
    if late_by > grace {
        Lateness::Misfired { missed_by: late_by }
    } else {
        Lateness::OnTime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Weekday};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn daily_after_todays_slot_rolls_to_tomorrow() {
        let next = next_fire_after(Cadence::Daily, at(2, 0), &utc(2025, 1, 1, 10, 0)).unwrap();
        assert_eq!(next, utc(2025, 1, 2, 2, 0));
    }

    #[test]
    fn daily_before_todays_slot_fires_today() {
        let next = next_fire_after(Cadence::Daily, at(2, 0), &utc(2025, 1, 1, 1, 59)).unwrap();
        assert_eq!(next, utc(2025, 1, 1, 2, 0));
    }

    #[test]
    fn exact_fire_time_is_not_repeated() {
        let next = next_fire_after(Cadence::Daily, at(2, 0), &utc(2025, 1, 1, 2, 0)).unwrap();
        assert_eq!(next, utc(2025, 1, 2, 2, 0));
    }

    #[test]
    fn hourly_fires_at_the_top_of_the_next_hour() {
        let next = next_fire_after(Cadence::Hourly, at(2, 0), &utc(2025, 1, 1, 10, 15)).unwrap();
        assert_eq!(next, utc(2025, 1, 1, 11, 0));
        let next = next_fire_after(Cadence::Hourly, at(2, 0), &utc(2025, 12, 31, 23, 30)).unwrap();
        assert_eq!(next, utc(2026, 1, 1, 0, 0));
    }

    #[test]
    fn weekly_fires_on_sunday() {
        // 2025-01-01 is a Wednesday.
        let next = next_fire_after(Cadence::Weekly, at(3, 30), &utc(2025, 1, 1, 10, 0)).unwrap();
        assert_eq!(next, utc(2025, 1, 5, 3, 30));
        assert_eq!(next.weekday(), Weekday::Sun);

        let later_that_sunday = next_fire_after(Cadence::Weekly, at(3, 30), &utc(2025, 1, 5, 4, 0)).unwrap();
        assert_eq!(later_that_sunday, utc(2025, 1, 12, 3, 30));
    }

    #[test]
    fn monthly_fires_on_the_first() {
        let next = next_fire_after(Cadence::Monthly, at(2, 0), &utc(2025, 1, 1, 10, 0)).unwrap();
        assert_eq!(next, utc(2025, 2, 1, 2, 0));
        let next = next_fire_after(Cadence::Monthly, at(2, 0), &utc(2025, 12, 15, 0, 0)).unwrap();
        assert_eq!(next, utc(2026, 1, 1, 2, 0));
        let next = next_fire_after(Cadence::Monthly, at(2, 0), &utc(2025, 3, 1, 1, 0)).unwrap();
        assert_eq!(next, utc(2025, 3, 1, 2, 0));
    }

    #[test]
    fn evaluates_in_the_callers_time_zone() {
        let tz = FixedOffset::east_opt(5 * 3600).unwrap();
        let after = tz.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let next = next_fire_after(Cadence::Daily, at(2, 0), &after).unwrap();
        assert_eq!(next, tz.with_ymd_and_hms(2025, 1, 2, 2, 0, 0).unwrap());
        assert_eq!(next.with_timezone(&Utc), utc(2025, 1, 1, 21, 0));
    }

    #[test]
    fn lateness_respects_grace() {
        let planned = utc(2025, 1, 1, 2, 0);
        let grace = Duration::seconds(60);
        assert_eq!(lateness(planned, planned + Duration::seconds(30), grace), Lateness::OnTime);
        assert_eq!(
            lateness(planned, planned + Duration::hours(5), grace),
            Lateness::Misfired {
                missed_by: Duration::hours(5)
            }
        );
    }
}
