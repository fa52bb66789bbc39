use std::str::FromStr;

use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime, TimeDelta, Weekday};
use serde::{Deserialize, Serialize};

use super::{FillError, MinuteIndex, SeriesBuilder, SparseSeries, TimeSlotSeries};

/// Calendar unit of a flexible step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

/// Distance between two flexible-mode slots, e.g. `15 minutes` or `1 month`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub amount: u32,
    pub unit: StepUnit,
}

impl Step {
    pub fn new(amount: u32, unit: StepUnit) -> Result<Self, FillError> {
        if amount == 0 {
            return Err(FillError::InvalidStep("step amount must be positive".into()));
        }
        Ok(Self { amount, unit })
    }

    /// Advance `from` by one step. Month and year steps clamp to the end of the
    /// target month.
    pub fn advance(&self, from: NaiveDateTime) -> Option<NaiveDateTime> {
        let amount = i64::from(self.amount);
        match self.unit {
            StepUnit::Minutes => from.checked_add_signed(TimeDelta::try_minutes(amount)?),
            StepUnit::Hours => from.checked_add_signed(TimeDelta::try_hours(amount)?),
            StepUnit::Days => from.checked_add_signed(TimeDelta::try_days(amount)?),
            StepUnit::Weeks => from.checked_add_signed(TimeDelta::try_weeks(amount)?),
            StepUnit::Months => from.checked_add_months(Months::new(self.amount)),
            StepUnit::Years => from.checked_add_months(Months::new(self.amount.checked_mul(12)?)),
        }
    }
}

impl FromStr for StepUnit {
    type Err = FillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "m" | "min" | "minute" | "minutes" => Ok(StepUnit::Minutes),
            "h" | "hour" | "hours" => Ok(StepUnit::Hours),
            "d" | "day" | "days" => Ok(StepUnit::Days),
            "w" | "week" | "weeks" => Ok(StepUnit::Weeks),
            "month" | "months" => Ok(StepUnit::Months),
            "y" | "year" | "years" => Ok(StepUnit::Years),
            other => Err(FillError::InvalidStep(format!("unknown unit '{}'", other))),
        }
    }
}

/// Parses `"<amount> <unit>"` or `"<amount><unit>"`, e.g. `"15 minutes"`, `"1h"`.
impl FromStr for Step {
    type Err = FillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| FillError::InvalidStep(format!("missing unit in '{}'", s)))?;
        let (amount, unit) = s.split_at(split);
        let amount: u32 = amount
            .parse()
            .map_err(|_| FillError::InvalidStep(format!("missing amount in '{}'", s)))?;
        Step::new(amount, unit.parse()?)
    }
}

/// One day at `interval_minutes` resolution: for every hour, minutes
/// `0, m, 2m, ...` below 60.
pub fn fill_day(
    date: NaiveDate,
    sparse: &SparseSeries,
    interval_minutes: u32,
) -> Result<TimeSlotSeries, FillError> {
    if !(1..=60).contains(&interval_minutes) {
        return Err(FillError::InvalidInterval(interval_minutes));
    }

    let index = MinuteIndex::new(sparse);
    let mut series = SeriesBuilder::new(&index);
    for hour in 0..24 {
        for minute in (0..60).step_by(interval_minutes as usize) {
            let slot = date
                .and_hms_opt(hour, minute, 0)
                .ok_or(FillError::OutOfRange)?;
            series.push(slot);
        }
    }
    Ok(series.finish())
}

/// Every step from `from` while the cursor is not after `until`. An empty series
/// when `from > until`.
///
/// The cursor keeps the seconds of `from`; only the slot keys drop them. A start
/// of `00:00:30` therefore never reaches an `until` of `00:10:00` with 5 minute
/// steps, and the last slot is `00:05:00`.
pub fn fill_flex(
    from: NaiveDateTime,
    until: NaiveDateTime,
    sparse: &SparseSeries,
    step: Step,
) -> Result<TimeSlotSeries, FillError> {
    if step.amount == 0 {
        return Err(FillError::InvalidStep("step amount must be positive".into()));
    }

    let index = MinuteIndex::new(sparse);
    let mut series = SeriesBuilder::new(&index);
    let mut cursor = from;
    while cursor <= until {
        series.push(cursor);
        match step.advance(cursor) {
            Some(next) => cursor = next,
            // The grid ran off the calendar; nothing after `cursor` is representable.
            None => break,
        }
    }
    Ok(series.finish())
}

/// Monday to Sunday of the ISO week containing `anchor`, at midnight.
pub fn fill_week(anchor: NaiveDate, sparse: &SparseSeries) -> Result<TimeSlotSeries, FillError> {
    let monday = anchor
        .checked_sub_days(Days::new(u64::from(anchor.weekday().num_days_from_monday())))
        .ok_or(FillError::OutOfRange)?;

    let index = MinuteIndex::new(sparse);
    let mut series = SeriesBuilder::new(&index);
    for offset in 0..7 {
        let day = monday
            .checked_add_days(Days::new(offset))
            .ok_or(FillError::OutOfRange)?;
        series.push(midnight(day)?);
    }
    Ok(series.finish())
}

/// One slot per ISO week of `year`, keyed by the week's Monday at midnight.
///
/// Weeks are enumerated through their Thursdays: a week belongs to the year its
/// Thursday falls in, so the first slot may be a Monday in late December of the
/// previous year.
pub fn fill_year(year: i32, sparse: &SparseSeries) -> Result<TimeSlotSeries, FillError> {
    let mut thursday =
        NaiveDate::from_isoywd_opt(year, 1, Weekday::Thu).ok_or(FillError::InvalidYear(year))?;

    let index = MinuteIndex::new(sparse);
    let mut series = SeriesBuilder::new(&index);
    while thursday.year() == year {
        let monday = thursday
            .checked_sub_days(Days::new(3))
            .ok_or(FillError::OutOfRange)?;
        series.push(midnight(monday)?);
        thursday = match thursday.checked_add_days(Days::new(7)) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(series.finish())
}

fn midnight(day: NaiveDate) -> Result<NaiveDateTime, FillError> {
    day.and_hms_opt(0, 0, 0).ok_or(FillError::OutOfRange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fill::{parse_anchor, DEFAULT_DAY_INTERVAL_MINUTES};

    fn sparse(entries: &[(&str, f64)]) -> SparseSeries {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Some(*v)))
            .collect()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn ts(s: &str) -> NaiveDateTime {
        parse_anchor(s).unwrap()
    }

    #[test]
    fn test_day_five_minute_grid() {
        let data = sparse(&[("2021-06-01 00:05:00", 3.0)]);
        let series = fill_day(date("2021-06-01"), &data, DEFAULT_DAY_INTERVAL_MINUTES).unwrap();

        assert_eq!(series.len(), 288);
        assert_eq!(series.first_key(), Some("2021-06-01 00:00:00"));
        assert_eq!(series.last_key(), Some("2021-06-01 23:55:00"));
        assert_eq!(series.get("2021-06-01 00:05:00"), Some(3.0));
        assert_eq!(series.filled(), 1);
    }

    #[test]
    fn test_day_interval_not_dividing_an_hour() {
        let series = fill_day(date("2021-06-01"), &SparseSeries::new(), 7).unwrap();
        // 0, 7, ..., 56 per hour
        assert_eq!(series.len(), 24 * 9);
        assert!(series.contains_key("2021-06-01 00:56:00"));
        assert!(series.contains_key("2021-06-01 01:00:00"));
    }

    #[test]
    fn test_day_rejects_bad_interval() {
        let empty = SparseSeries::new();
        assert_eq!(
            fill_day(date("2021-06-01"), &empty, 0),
            Err(FillError::InvalidInterval(0))
        );
        assert_eq!(
            fill_day(date("2021-06-01"), &empty, 61),
            Err(FillError::InvalidInterval(61))
        );
        assert_eq!(fill_day(date("2021-06-01"), &empty, 60).unwrap().len(), 24);
    }

    #[test]
    fn test_day_ignores_readings_of_other_days() {
        let data = sparse(&[("2021-06-02 00:05:00", 3.0), ("2021-06-01 12:00:30", 1.0)]);
        let series = fill_day(date("2021-06-01"), &data, 15).unwrap();
        assert_eq!(series.filled(), 1);
        assert_eq!(series.get("2021-06-01 12:00:00"), Some(1.0));
    }

    #[test]
    fn test_flex_inclusive_boundary() {
        let step: Step = "5 minutes".parse().unwrap();
        let series = fill_flex(
            ts("2021-06-01 00:00:00"),
            ts("2021-06-01 00:10:00"),
            &sparse(&[("2021-06-01 00:10:00", 2.0)]),
            step,
        )
        .unwrap();

        let keys: Vec<_> = series.keys().collect();
        assert_eq!(
            keys,
            vec![
                "2021-06-01 00:00:00",
                "2021-06-01 00:05:00",
                "2021-06-01 00:10:00"
            ]
        );
        assert_eq!(series.get("2021-06-01 00:10:00"), Some(2.0));
    }

    #[test]
    fn test_flex_steps_from_unrounded_start() {
        let data = sparse(&[("2021-06-01 00:05:00", 4.0)]);
        let series = fill_flex(
            ts("2021-06-01 00:00:30"),
            ts("2021-06-01 00:10:00"),
            &data,
            Step::new(5, StepUnit::Minutes).unwrap(),
        )
        .unwrap();

        let keys: Vec<_> = series.keys().collect();
        assert_eq!(keys, vec!["2021-06-01 00:00:00", "2021-06-01 00:05:00"]);
        assert_eq!(series.get("2021-06-01 00:05:00"), Some(4.0));
    }

    #[test]
    fn test_flex_months_clamp_to_month_end() {
        let series = fill_flex(
            ts("2021-01-31"),
            ts("2021-04-30"),
            &SparseSeries::new(),
            Step::new(1, StepUnit::Months).unwrap(),
        )
        .unwrap();
        let keys: Vec<_> = series.keys().collect();
        assert_eq!(
            keys,
            vec![
                "2021-01-31 00:00:00",
                "2021-02-28 00:00:00",
                "2021-03-28 00:00:00",
                "2021-04-28 00:00:00"
            ]
        );
    }

    #[test]
    fn test_flex_empty_when_from_after_until() {
        let series = fill_flex(
            ts("2021-06-02"),
            ts("2021-06-01"),
            &SparseSeries::new(),
            Step::new(1, StepUnit::Days).unwrap(),
        )
        .unwrap();
        assert!(series.is_empty());
    }

    #[test]
    fn test_step_parsing() {
        assert_eq!(
            "15min".parse::<Step>().unwrap(),
            Step {
                amount: 15,
                unit: StepUnit::Minutes
            }
        );
        assert_eq!(
            "2 weeks".parse::<Step>().unwrap(),
            Step {
                amount: 2,
                unit: StepUnit::Weeks
            }
        );
        assert!("0 days".parse::<Step>().is_err());
        assert!("days".parse::<Step>().is_err());
        assert!("3 fortnights".parse::<Step>().is_err());
    }

    #[test]
    fn test_week_monday_to_sunday() {
        let data = sparse(&[("2021-06-06 00:00:00", 5.0)]);
        let series = fill_week(date("2021-06-02"), &data).unwrap();

        assert_eq!(series.len(), 7);
        assert_eq!(series.first_key(), Some("2021-05-31 00:00:00"));
        assert_eq!(series.last_key(), Some("2021-06-06 00:00:00"));
        assert_eq!(series.get("2021-06-06 00:00:00"), Some(5.0));
    }

    #[test]
    fn test_year_iso_week_counts() {
        let empty = SparseSeries::new();
        let y2020 = fill_year(2020, &empty).unwrap();
        let y2021 = fill_year(2021, &empty).unwrap();

        assert_eq!(y2020.len(), 53);
        assert_eq!(y2020.first_key(), Some("2019-12-30 00:00:00"));
        assert_eq!(y2020.last_key(), Some("2020-12-28 00:00:00"));
        assert_eq!(y2021.len(), 52);
        assert_eq!(y2021.first_key(), Some("2021-01-04 00:00:00"));
    }

    #[test]
    fn test_year_picks_up_monday_readings() {
        let data = sparse(&[("2021-01-04 00:00:00", 120.0), ("2021-01-05 00:00:00", 1.0)]);
        let series = fill_year(2021, &data).unwrap();
        assert_eq!(series.filled(), 1);
        assert_eq!(series.get("2021-01-04 00:00:00"), Some(120.0));
    }
}
