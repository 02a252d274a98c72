//! Time-zoned daily trigger for the scheduled feed refresh.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Local wall-clock time of the daily refresh.
pub const REFRESH_HOUR: u32 = 1;
pub const REFRESH_MINUTE: u32 = 0;

/// Next occurrence of `hour:minute` local time strictly after `now`.
/// A wall-clock time skipped by a DST transition rolls to the next day.
pub fn next_occurrence(now: DateTime<Tz>, hour: u32, minute: u32) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut date = now.date_naive();

    loop {
        if let Some(local) = date.and_hms_opt(hour, minute, 0) {
            if let Some(candidate) = tz.from_local_datetime(&local).earliest() {
                if candidate > now {
                    return candidate;
                }
            }
        }
        date = date.succ_opt().expect("date range exhausted");
    }
}

/// Run `job` every day at 01:00 in the feed's time zone, on a detached
/// worker thread that lives for the process lifetime.
pub fn spawn_daily<F>(tz: Tz, job: F) -> thread::JoinHandle<()>
where
    F: Fn() + Send + 'static,
{
    thread::spawn(move || loop {
        let now = Utc::now().with_timezone(&tz);
        let next = next_occurrence(now, REFRESH_HOUR, REFRESH_MINUTE);
        let wait = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        log::info!("next scheduled feed refresh at {next}");

        thread::sleep(wait);
        job();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Pacific::Auckland;

    #[test]
    fn before_the_trigger_time_stays_on_the_same_day() {
        let now = Auckland.with_ymd_and_hms(2024, 7, 15, 0, 30, 0).unwrap();
        let next = next_occurrence(now, 1, 0);
        assert_eq!(
            next,
            Auckland.with_ymd_and_hms(2024, 7, 15, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn at_or_after_the_trigger_time_rolls_to_tomorrow() {
        let exactly = Auckland.with_ymd_and_hms(2024, 7, 15, 1, 0, 0).unwrap();
        assert_eq!(
            next_occurrence(exactly, 1, 0),
            Auckland.with_ymd_and_hms(2024, 7, 16, 1, 0, 0).unwrap()
        );

        let later = Auckland.with_ymd_and_hms(2024, 7, 15, 13, 0, 0).unwrap();
        assert_eq!(
            next_occurrence(later, 1, 0),
            Auckland.with_ymd_and_hms(2024, 7, 16, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn month_boundaries_advance_cleanly() {
        let now = Auckland.with_ymd_and_hms(2024, 7, 31, 2, 0, 0).unwrap();
        assert_eq!(
            next_occurrence(now, 1, 0),
            Auckland.with_ymd_and_hms(2024, 8, 1, 1, 0, 0).unwrap()
        );
    }
}
