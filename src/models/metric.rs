// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Health metrics, their records and the date windows they are fetched in.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// A metric synchronized for each profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub enum Metric {
    Steps,
    #[serde(rename = "rhr")]
    RestingHeartRate,
    Hrv,
    Sleep,
}

impl Metric {
    /// Fixed execution order within a job.
    pub const ALL: [Metric; 4] = [
        Metric::Steps,
        Metric::RestingHeartRate,
        Metric::Hrv,
        Metric::Sleep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Steps => "steps",
            Metric::RestingHeartRate => "rhr",
            Metric::Hrv => "hrv",
            Metric::Sleep => "sleep",
        }
    }

    /// CSV file name under `profiles/<id>/csv/`.
    pub fn file_name(&self) -> &'static str {
        match self {
            Metric::Steps => "fitbit_activity.csv",
            Metric::RestingHeartRate => "fitbit_rhr.csv",
            Metric::Hrv => "fitbit_hrv.csv",
            Metric::Sleep => "fitbit_sleep.csv",
        }
    }

    /// Value columns, in file order (the `date` column is implicit).
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Metric::Steps => &["steps", "sedentaryMinutes"],
            Metric::RestingHeartRate => &["restingHeartRate"],
            Metric::Hrv => &["dailyRmssd", "deepRmssd"],
            Metric::Sleep => &[
                "logId",
                "startTime",
                "endTime",
                "minutesAsleep",
                "minutesAwake",
                "minutesToFallAsleep",
                "timeInBed",
                "efficiency",
                "minutesDeep",
                "minutesREM",
                "minutesLight",
                "minutesWake",
            ],
        }
    }

    /// Longest date span one API request may cover.
    pub fn max_window_days(&self) -> i64 {
        match self {
            Metric::Steps => 90,
            Metric::RestingHeartRate => 90,
            Metric::Hrv => 30,
            Metric::Sleep => 100,
        }
    }

    /// First day to fetch when neither stored data nor `memberSince` is known.
    pub fn fallback_start(&self) -> NaiveDate {
        match self {
            Metric::Steps | Metric::Sleep => NaiveDate::from_ymd_opt(2018, 8, 1),
            Metric::RestingHeartRate | Metric::Hrv => NaiveDate::from_ymd_opt(2019, 1, 1),
        }
        .unwrap_or_default()
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "steps" | "activity" => Ok(Metric::Steps),
            "rhr" | "resting_heart_rate" => Ok(Metric::RestingHeartRate),
            "hrv" => Ok(Metric::Hrv),
            "sleep" => Ok(Metric::Sleep),
            other => Err(format!("unknown metric {other:?}")),
        }
    }
}

/// One day of one metric. Unique per `(profile, metric, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub date: NaiveDate,
    /// Column name to rendered value
    pub values: BTreeMap<String, String>,
}

impl MetricRecord {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, column: &str, value: impl ToString) -> Self {
        self.values.insert(column.to_string(), value.to_string());
        self
    }
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// `None` if `start` is after `end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Split into consecutive windows of at most `max_days` days.
    pub fn chunks(&self, max_days: i64) -> Vec<DateWindow> {
        let step = max_days.max(1);
        let mut out = Vec::new();
        let mut start = self.start;
        while start <= self.end {
            let end = (start + Duration::days(step - 1)).min(self.end);
            out.push(DateWindow { start, end });
            start = end + Duration::days(1);
        }
        out
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_chunks_cover_range_without_overlap() {
        let window = DateWindow::new(d(2024, 1, 1), d(2024, 3, 15)).unwrap();
        let chunks = window.chunks(30);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], DateWindow::new(d(2024, 1, 1), d(2024, 1, 30)).unwrap());
        assert_eq!(chunks[1].start, d(2024, 1, 31));
        assert_eq!(chunks[2].end, d(2024, 3, 15));
        let total: i64 = chunks.iter().map(DateWindow::days).sum();
        assert_eq!(total, window.days());
    }

    #[test]
    fn test_single_day_window() {
        let window = DateWindow::new(d(2024, 5, 5), d(2024, 5, 5)).unwrap();
        assert_eq!(window.chunks(90), vec![window]);
        assert!(DateWindow::new(d(2024, 5, 6), d(2024, 5, 5)).is_none());
    }

    #[test]
    fn test_metric_names_round_trip() {
        for metric in Metric::ALL {
            assert_eq!(metric.as_str().parse::<Metric>().unwrap(), metric);
        }
        assert!("weight".parse::<Metric>().is_err());
        assert_eq!(
            serde_json::to_string(&Metric::RestingHeartRate).unwrap(),
            "\"rhr\""
        );
    }
}
