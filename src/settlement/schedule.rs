use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::error::{AppError, AppResult};
use crate::settlement::models::PeriodType;

pub const DEFAULT_DAY_OF_WEEK: u32 = 1;
pub const DEFAULT_DAY_OF_MONTH: u32 = 1;

pub fn validate_day_of_week(day: u32) -> AppResult<u32> {
    if day > 6 {
        return Err(AppError::InvalidInput(format!(
            "dayOfWeek must be 0 (Sunday) to 6 (Saturday), got {}",
            day
        )));
    }
    Ok(day)
}

pub fn validate_day_of_month(day: u32) -> AppResult<u32> {
    if !(1..=31).contains(&day) {
        return Err(AppError::InvalidInput(format!(
            "dayOfMonth must be 1 to 31, got {}",
            day
        )));
    }
    Ok(day)
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// Shift a (year, month) pair by `delta` months
fn shift_month(year: i32, month: u32, delta: i32) -> (i32, u32) {
    let index = year * 12 + (month as i32 - 1) + delta;
    (index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
}

/// `day` clamped to the last day of the month
fn clamped_date(year: i32, month: u32, day: u32) -> AppResult<NaiveDate> {
    let day = day.min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| AppError::InvalidInput(format!("Invalid date {}-{}-{}", year, month, day)))
}

/// Calendar arithmetic for schedules, evaluated in the users' zone
#[derive(Debug, Clone, Copy)]
pub struct ScheduleClock {
    tz: FixedOffset,
    run_hour: u32,
}

impl ScheduleClock {
    pub fn new(tz: FixedOffset, run_hour: u32) -> Self {
        Self { tz, run_hour }
    }

    fn at_run_hour(&self, date: NaiveDate) -> AppResult<DateTime<Utc>> {
        let time = NaiveTime::from_hms_opt(self.run_hour, 0, 0)
            .ok_or_else(|| AppError::Config(format!("Invalid run hour {}", self.run_hour)))?;
        self.tz
            .from_local_datetime(&date.and_time(time))
            .single()
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(|| AppError::Internal(format!("Ambiguous local time on {}", date)))
    }

    /// When a schedule should next fire after `now`. Always strictly in the future.
    pub fn next_run(
        &self,
        period: PeriodType,
        day_of_week: u32,
        day_of_month: u32,
        now: DateTime<Utc>,
    ) -> AppResult<DateTime<Utc>> {
        let today = now.with_timezone(&self.tz).date_naive();

        match period {
            PeriodType::Daily => self.at_run_hour(today + Duration::days(1)),
            PeriodType::Weekly => {
                let target = validate_day_of_week(day_of_week)?;
                let current = today.weekday().num_days_from_sunday();
                let mut days_ahead = (target + 7 - current) % 7;
                if days_ahead == 0 {
                    days_ahead = 7;
                }
                self.at_run_hour(today + Duration::days(days_ahead as i64))
            }
            PeriodType::Monthly => {
                let day = validate_day_of_month(day_of_month)?;
                let mut delta = 1;
                loop {
                    let (year, month) = shift_month(today.year(), today.month(), delta);
                    let next = self.at_run_hour(clamped_date(year, month, day)?)?;
                    if next > now {
                        return Ok(next);
                    }
                    delta += 1;
                }
            }
            PeriodType::Custom => Err(AppError::InvalidInput(
                "Custom periods cannot be scheduled".to_string(),
            )),
        }
    }

    /// Start of the window ending at `now` for one period unit
    pub fn period_start(
        &self,
        period: PeriodType,
        day_of_month: u32,
        now: DateTime<Utc>,
    ) -> AppResult<DateTime<Utc>> {
        match period {
            PeriodType::Daily => Ok(now - Duration::days(1)),
            PeriodType::Weekly => Ok(now - Duration::days(7)),
            PeriodType::Monthly => {
                let day = validate_day_of_month(day_of_month)?;
                let local = now.with_timezone(&self.tz);
                let (year, month) = shift_month(local.year(), local.month(), -1);
                let date = clamped_date(year, month, day)?;
                self.tz
                    .from_local_datetime(&date.and_time(local.time()))
                    .single()
                    .map(|start| start.with_timezone(&Utc))
                    .ok_or_else(|| AppError::Internal(format!("Ambiguous local time on {}", date)))
            }
            PeriodType::Custom => Err(AppError::InvalidInput(
                "Custom periods have no implicit start date".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn kst_clock() -> ScheduleClock {
        ScheduleClock::new(FixedOffset::east_opt(9 * 3600).unwrap(), 9)
    }

    // 2024-01-15 10:00 KST, a Monday
    fn monday_morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 1, 0, 0).unwrap()
    }

    #[test]
    fn test_daily_lands_on_next_day_at_nine_local() {
        let next = kst_clock()
            .next_run(PeriodType::Daily, 1, 1, monday_morning())
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_daily_uses_local_date_not_utc_date() {
        // 2024-01-15 23:30 UTC is already Tuesday 08:30 in Seoul
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 23, 30, 0).unwrap();
        let next = kst_clock().next_run(PeriodType::Daily, 1, 1, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 17, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_weekly_same_day_rolls_a_full_week() {
        let next = kst_clock()
            .next_run(PeriodType::Weekly, 1, 1, monday_morning())
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 22, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_weekly_later_this_week() {
        let next = kst_clock()
            .next_run(PeriodType::Weekly, 3, 1, monday_morning())
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 17, 0, 0, 0).unwrap());

        let sunday = kst_clock()
            .next_run(PeriodType::Weekly, 0, 1, monday_morning())
            .unwrap();
        assert_eq!(sunday, Utc.with_ymd_and_hms(2024, 1, 21, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_monthly_clamps_to_short_month() {
        let next = kst_clock()
            .next_run(PeriodType::Monthly, 1, 31, monday_morning())
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_monthly_crosses_year_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 12, 20, 3, 0, 0).unwrap();
        let next = kst_clock().next_run(PeriodType::Monthly, 1, 5, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 5, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_always_in_future() {
        let clock = kst_clock();
        let now = monday_morning();
        for period in [PeriodType::Daily, PeriodType::Weekly, PeriodType::Monthly] {
            for dow in 0..7 {
                assert!(clock.next_run(period, dow, 15, now).unwrap() > now);
            }
        }
    }

    #[test]
    fn test_invalid_days_rejected() {
        let clock = kst_clock();
        assert!(clock.next_run(PeriodType::Weekly, 7, 1, monday_morning()).is_err());
        assert!(clock.next_run(PeriodType::Monthly, 1, 0, monday_morning()).is_err());
        assert!(clock.next_run(PeriodType::Custom, 1, 1, monday_morning()).is_err());
    }

    #[test]
    fn test_period_start_per_unit() {
        let clock = kst_clock();
        let now = monday_morning();
        assert_eq!(clock.period_start(PeriodType::Daily, 1, now).unwrap(), now - Duration::days(1));
        assert_eq!(clock.period_start(PeriodType::Weekly, 1, now).unwrap(), now - Duration::days(7));
        assert!(clock.period_start(PeriodType::Custom, 1, now).is_err());
    }

    #[test]
    fn test_monthly_period_start_reanchored_to_day_of_month() {
        // 2024-03-10 10:00 KST
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 1, 0, 0).unwrap();
        let start = kst_clock().period_start(PeriodType::Monthly, 31, now).unwrap();
        // February 2024 has 29 days; local time of day is kept
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 29, 1, 0, 0).unwrap());
        assert_eq!(start.minute(), 0);
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2024, 12), 31);
        assert_eq!(days_in_month(2024, 4), 30);
    }
}
