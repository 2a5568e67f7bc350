//! Calendar-month subtraction for the `use_recent_only` cutoff filter
//! (spec §8 property 3). Overflow days — e.g. subtracting a month from
//! March 31st — pin to the last day of the target month rather than
//! rolling into the following month, which is what naive day-count
//! subtraction would do.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

/// Number of days in `year-month`.
fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1).expect("valid date");
    let first_of_this = NaiveDate::from_ymd_opt(year, month, 1).expect("valid date");
    (first_of_next - first_of_this).num_days() as u32
}

/// Subtract `months` whole calendar months from `from`, pinning an
/// overflowing day-of-month to the last day of the target month.
pub fn subtract_months(from: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    let total_months = from.year() as i64 * 12 + from.month0() as i64 - months as i64;
    let target_year = total_months.div_euclid(12) as i32;
    let target_month0 = total_months.rem_euclid(12) as u32;
    let target_month = target_month0 + 1;

    let max_day = days_in_month(target_year, target_month);
    let day = from.day().min(max_day);

    let naive_date =
        NaiveDate::from_ymd_opt(target_year, target_month, day).expect("valid calendar date");
    let naive_time = from.time();
    Utc.from_utc_datetime(&naive_date.and_time(naive_time))
}

/// Compute the cutoff timestamp for `use_recent_only`, given the configured
/// window length in months (default 3, spec §6).
pub fn recent_cutoff(now_utc: DateTime<Utc>, window_months: u32) -> DateTime<Utc> {
    subtract_months(now_utc, window_months)
}
