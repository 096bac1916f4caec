//! Calendar bucketing for activity records.
//!
//! Every chart reads the same way: pick a granularity, pick what a record is
//! worth, and get back a gap-filled series in chronological order with its
//! running total and rounded mean.

pub mod selectors;

use chrono::{Datelike, Duration, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use statline_core::Record;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }

    /// First day of the bucket containing `date`.
    pub fn bucket_start(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Granularity::Day => date,
            Granularity::Week => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            Granularity::Month => date.with_day(1).unwrap_or(date),
        }
    }

    /// Label for the bucket containing `date`: `YYYY-MM-DD`, ISO `YYYY-Www`,
    /// or `YYYY-MM`.
    pub fn label(&self, date: NaiveDate) -> String {
        match self {
            Granularity::Day => date.format("%Y-%m-%d").to_string(),
            Granularity::Week => {
                let week = date.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Granularity::Month => date.format("%Y-%m").to_string(),
        }
    }

    fn next_start(&self, start: NaiveDate) -> Option<NaiveDate> {
        match self {
            Granularity::Day => start.succ_opt(),
            Granularity::Week => start.checked_add_signed(Duration::days(7)),
            Granularity::Month => start.checked_add_months(Months::new(1)),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "day" | "daily" => Ok(Granularity::Day),
            "week" | "weekly" => Ok(Granularity::Week),
            "month" | "monthly" => Ok(Granularity::Month),
            other => Err(format!("Unknown granularity: {other}")),
        }
    }
}

/// One calendar-aligned aggregation unit. Recomputed per call.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub key: String,
    pub sort_key: NaiveDate,
    pub accumulated: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
    pub cumulative: Vec<f64>,
    pub average: f64,
}

impl Series {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    fn from_buckets(buckets: Vec<Bucket>) -> Self {
        let mut labels = Vec::with_capacity(buckets.len());
        let mut values = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            labels.push(bucket.key);
            values.push(bucket.accumulated);
        }
        let cumulative = cumulative(&values);
        let average = average(&values);
        Self {
            labels,
            values,
            cumulative,
            average,
        }
    }
}

/// Optional inclusive `YYYY-MM-DD` bounds. Only honoured at day granularity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<String>,
    pub to: Option<String>,
}

impl DateRange {
    pub fn new(from: Option<&str>, to: Option<&str>) -> Self {
        Self {
            from: from.map(str::to_string),
            to: to.map(str::to_string),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

pub fn aggregate<F>(
    records: &[Record],
    granularity: Granularity,
    selector: F,
    range: &DateRange,
) -> Series
where
    F: Fn(&Record) -> f64,
{
    let buckets = fill_buckets(records, granularity, selector);
    let buckets = match granularity {
        Granularity::Day => filter_day_buckets(buckets, range),
        // Week and month labels pass through unfiltered; consumers rely on
        // receiving the full series regardless of the selected dates.
        Granularity::Week | Granularity::Month => buckets,
    };
    Series::from_buckets(buckets)
}

/// Buckets records and enumerates every bucket between the earliest and the
/// latest observed one, zero-filling the gaps.
pub fn fill_buckets<F>(records: &[Record], granularity: Granularity, selector: F) -> Vec<Bucket>
where
    F: Fn(&Record) -> f64,
{
    let mut observed = BTreeMap::<NaiveDate, f64>::new();
    for record in records {
        // One out-of-scale timestamp would otherwise gap-fill millions of
        // buckets.
        if !record.has_epoch_seconds() {
            warn!(
                event = "aggregate_skip_record",
                primary_key = %record.primary_key,
                timestamp = record.timestamp,
                "timestamp is not epoch seconds"
            );
            continue;
        }
        let Some(datetime) = record.datetime() else {
            warn!(
                event = "aggregate_skip_record",
                primary_key = %record.primary_key,
                timestamp = record.timestamp,
                "timestamp out of range"
            );
            continue;
        };
        let start = granularity.bucket_start(datetime.date_naive());
        *observed.entry(start).or_insert(0.0) += selector(record);
    }

    let (Some(first), Some(last)) = (
        observed.keys().next().copied(),
        observed.keys().next_back().copied(),
    ) else {
        return Vec::new();
    };

    let mut buckets = Vec::new();
    let mut cursor = Some(first);
    while let Some(start) = cursor.filter(|start| *start <= last) {
        buckets.push(Bucket {
            key: granularity.label(start),
            sort_key: start,
            accumulated: observed.get(&start).copied().unwrap_or(0.0),
        });
        cursor = granularity.next_start(start);
    }
    buckets
}

/// Contiguous inclusive slice of day buckets. Day labels sort lexically in
/// chronological order, so the bounds compare as plain strings.
fn filter_day_buckets(buckets: Vec<Bucket>, range: &DateRange) -> Vec<Bucket> {
    if range.is_unbounded() {
        return buckets;
    }
    buckets
        .into_iter()
        .filter(|bucket| {
            range
                .from
                .as_deref()
                .map_or(true, |from| bucket.key.as_str() >= from)
                && range
                    .to
                    .as_deref()
                    .map_or(true, |to| bucket.key.as_str() <= to)
        })
        .collect()
}

pub fn cumulative(values: &[f64]) -> Vec<f64> {
    values
        .iter()
        .scan(0.0, |running, value| {
            *running += value;
            Some(*running)
        })
        .collect()
}

/// Mean rounded half-up; 0 for an empty series.
pub fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    (mean + 0.5).floor()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selectors;
    use serde_json::json;

    fn at(date: &str, value: f64) -> Record {
        let day = NaiveDate::parse_from_str(date, "%Y-%m-%d").expect("valid date");
        let ts = day
            .and_hms_opt(12, 0, 0)
            .expect("valid time")
            .and_utc()
            .timestamp();
        Record::new(format!("{date}-{value}"), 1, ts, json!({ "value": value }))
    }

    fn value_of(record: &Record) -> f64 {
        selectors::payload_number("value")(record)
    }

    fn ten_days() -> Vec<Record> {
        (1..=10)
            .map(|day| at(&format!("2024-01-{day:02}"), f64::from(day)))
            .collect()
    }

    #[test]
    fn fills_interior_day_gaps_with_zero() {
        let records = vec![at("2024-01-03", 2.0), at("2024-01-01", 5.0)];
        let series = aggregate(&records, Granularity::Day, value_of, &DateRange::default());
        assert_eq!(series.labels, vec!["2024-01-01", "2024-01-02", "2024-01-03"]);
        assert_eq!(series.values, vec![5.0, 0.0, 2.0]);
        assert_eq!(series.cumulative, vec![5.0, 5.0, 7.0]);
    }

    #[test]
    fn iso_week_spans_the_year_boundary() {
        let last_day = NaiveDate::from_ymd_opt(2024, 12, 31).expect("date");
        let second_day = NaiveDate::from_ymd_opt(2025, 1, 2).expect("date");
        assert_eq!(Granularity::Week.label(last_day), "2025-W01");
        assert_eq!(Granularity::Week.label(second_day), "2025-W01");

        let records = vec![at("2024-12-31", 1.0), at("2025-01-02", 2.0)];
        let series = aggregate(&records, Granularity::Week, value_of, &DateRange::default());
        assert_eq!(series.labels, vec!["2025-W01"]);
        assert_eq!(series.values, vec![3.0]);
    }

    #[test]
    fn weeks_sort_chronologically_not_lexically() {
        let records = vec![at("2025-01-08", 1.0), at("2024-12-23", 4.0)];
        let series = aggregate(&records, Granularity::Week, value_of, &DateRange::default());
        assert_eq!(series.labels, vec!["2024-W52", "2025-W01", "2025-W02"]);
        assert_eq!(series.values, vec![4.0, 0.0, 1.0]);
    }

    #[test]
    fn months_gap_fill_across_years() {
        let records = vec![at("2023-11-15", 3.0), at("2024-02-01", 1.0), at("2023-11-02", 1.0)];
        let series = aggregate(&records, Granularity::Month, value_of, &DateRange::default());
        assert_eq!(series.labels, vec!["2023-11", "2023-12", "2024-01", "2024-02"]);
        assert_eq!(series.values, vec![4.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn derived_series_match_running_total_and_rounded_mean() {
        assert_eq!(cumulative(&[1.0, 2.0, 3.0, 4.0]), vec![1.0, 3.0, 6.0, 10.0]);
        // 2.5 rounds half-up to 3.
        assert_eq!(average(&[1.0, 2.0, 3.0, 4.0]), 3.0);
        assert_eq!(average(&[1.0, 1.0, 2.0]), 1.0);
        assert_eq!(average(&[]), 0.0);
    }

    #[test]
    fn millisecond_timestamp_does_not_stretch_the_series() {
        let mut records = vec![at("2024-01-01", 3.0), at("2024-01-02", 1.0)];
        records.push(Record::new(
            "ms",
            1,
            1_704_067_200_000,
            json!({ "value": 99.0 }),
        ));
        let series = aggregate(&records, Granularity::Day, value_of, &DateRange::default());
        assert_eq!(series.labels, vec!["2024-01-01", "2024-01-02"]);
        assert_eq!(series.values, vec![3.0, 1.0]);
    }

    #[test]
    fn empty_and_single_record_inputs() {
        let empty = aggregate(&[], Granularity::Day, selectors::count, &DateRange::default());
        assert!(empty.is_empty());
        assert!(empty.cumulative.is_empty());
        assert_eq!(empty.average, 0.0);

        let single = aggregate(
            &[at("2024-03-09", 7.0)],
            Granularity::Month,
            value_of,
            &DateRange::default(),
        );
        assert_eq!(single.labels, vec!["2024-03"]);
        assert_eq!(single.cumulative, vec![7.0]);
        assert_eq!(single.average, 7.0);
    }

    #[test]
    fn day_range_filter_slices_inclusively() {
        let range = DateRange::new(Some("2024-01-03"), Some("2024-01-05"));
        let series = aggregate(&ten_days(), Granularity::Day, value_of, &range);
        assert_eq!(series.labels, vec!["2024-01-03", "2024-01-04", "2024-01-05"]);
        assert_eq!(series.values, vec![3.0, 4.0, 5.0]);
        assert_eq!(series.cumulative, vec![3.0, 7.0, 12.0]);
        assert_eq!(series.average, 4.0);

        let open_ended = DateRange::new(Some("2024-01-09"), None);
        let tail = aggregate(&ten_days(), Granularity::Day, value_of, &open_ended);
        assert_eq!(tail.labels, vec!["2024-01-09", "2024-01-10"]);
    }

    #[test]
    fn week_and_month_ignore_the_range_filter() {
        let range = DateRange::new(Some("2024-01-03"), Some("2024-01-05"));
        let unfiltered = DateRange::default();
        for granularity in [Granularity::Week, Granularity::Month] {
            assert_eq!(
                aggregate(&ten_days(), granularity, value_of, &range),
                aggregate(&ten_days(), granularity, value_of, &unfiltered)
            );
        }
        let weeks = aggregate(&ten_days(), Granularity::Week, value_of, &range);
        assert_eq!(weeks.labels, vec!["2024-W01", "2024-W02"]);
    }

    #[test]
    fn count_selector_tallies_records() {
        let records = vec![at("2024-05-01", 9.0), at("2024-05-01", 3.0), at("2024-05-02", 1.0)];
        let series = aggregate(&records, Granularity::Day, selectors::count, &DateRange::default());
        assert_eq!(series.values, vec![2.0, 1.0]);
    }

    #[test]
    fn granularity_parses_case_insensitively() {
        assert_eq!("Weekly".parse::<Granularity>(), Ok(Granularity::Week));
        assert_eq!(Granularity::Month.to_string(), "month");
        assert!("hour".parse::<Granularity>().is_err());
    }
}
