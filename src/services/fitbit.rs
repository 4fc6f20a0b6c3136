// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Fitbit Web API endpoints and payload parsing.
//!
//! Only the fields that end up in a [`MetricRecord`] are read; everything
//! else in the payload is ignored.

use crate::models::{DateWindow, Metric, MetricRecord};
use crate::time_utils::parse_date;
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::BTreeMap;

pub const PROFILE_PATH: &str = "/1/user/-/profile.json";

/// One date-ranged time series. A metric is built from one or more series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Series {
    Steps,
    Sedentary,
    Heart,
    Hrv,
    Sleep,
}

impl Series {
    pub fn for_metric(metric: Metric) -> &'static [Series] {
        match metric {
            Metric::Steps => &[Series::Steps, Series::Sedentary],
            Metric::RestingHeartRate => &[Series::Heart],
            Metric::Hrv => &[Series::Hrv],
            Metric::Sleep => &[Series::Sleep],
        }
    }

    /// Request path (relative to the API base) covering `window`.
    pub fn path(&self, window: &DateWindow) -> String {
        let (s, e) = (window.start, window.end);
        match self {
            Series::Steps => format!("/1/user/-/activities/steps/date/{s}/{e}.json"),
            Series::Sedentary => format!("/1/user/-/activities/minutesSedentary/date/{s}/{e}.json"),
            Series::Heart => format!("/1/user/-/activities/heart/date/{s}/{e}.json"),
            Series::Hrv => format!("/1/user/-/hrv/date/{s}/{e}.json"),
            Series::Sleep => format!("/1.2/user/-/sleep/date/{s}/{e}.json"),
        }
    }

    /// Extract one record per date.
    pub fn parse(&self, body: &Value) -> Result<Vec<MetricRecord>, String> {
        match self {
            Series::Steps => parse_activity(body, "activities-steps", "steps"),
            Series::Sedentary => {
                parse_activity(body, "activities-minutesSedentary", "sedentaryMinutes")
            }
            Series::Heart => parse_heart(body),
            Series::Hrv => parse_hrv(body),
            Series::Sleep => parse_sleep(body),
        }
    }
}

/// Combine records from several series into one record per date.
pub fn merge_by_date(records: impl IntoIterator<Item = MetricRecord>) -> Vec<MetricRecord> {
    let mut merged: BTreeMap<NaiveDate, MetricRecord> = BTreeMap::new();
    for record in records {
        merged
            .entry(record.date)
            .or_insert_with(|| MetricRecord::new(record.date))
            .values
            .extend(record.values);
    }
    merged.into_values().collect()
}

/// `user.memberSince` from the profile endpoint.
pub fn parse_member_since(body: &Value) -> Option<NaiveDate> {
    body.get("user")?
        .get("memberSince")?
        .as_str()
        .and_then(parse_date)
}

fn entries<'a>(body: &'a Value, key: &str) -> Result<&'a [Value], String> {
    match body.get(key) {
        Some(Value::Array(items)) => Ok(items),
        // A window with no data may omit the key entirely.
        None | Some(Value::Null) => Ok(&[]),
        Some(_) => Err(format!("'{key}' is not an array")),
    }
}

fn entry_date(entry: &Value, field: &str) -> Option<NaiveDate> {
    entry.get(field)?.as_str().and_then(parse_date)
}

/// Render a scalar JSON value as a CSV cell; `None` for null/absent.
fn cell(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn parse_activity(body: &Value, key: &str, column: &str) -> Result<Vec<MetricRecord>, String> {
    let mut out = Vec::new();
    for entry in entries(body, key)? {
        let Some(date) = entry_date(entry, "dateTime") else {
            continue;
        };
        if let Some(value) = cell(entry.get("value")) {
            out.push(MetricRecord::new(date).with(column, value));
        }
    }
    Ok(out)
}

fn parse_heart(body: &Value) -> Result<Vec<MetricRecord>, String> {
    let mut out = Vec::new();
    for entry in entries(body, "activities-heart")? {
        let Some(date) = entry_date(entry, "dateTime") else {
            continue;
        };
        // Days without a resting value are skipped rather than stored empty.
        if let Some(rhr) = cell(entry.pointer("/value/restingHeartRate")) {
            out.push(MetricRecord::new(date).with("restingHeartRate", rhr));
        }
    }
    Ok(out)
}

fn parse_hrv(body: &Value) -> Result<Vec<MetricRecord>, String> {
    let mut out = Vec::new();
    for entry in entries(body, "hrv")? {
        let Some(date) = entry_date(entry, "dateTime") else {
            continue;
        };
        let mut record = MetricRecord::new(date);
        for column in ["dailyRmssd", "deepRmssd"] {
            if let Some(v) = cell(entry.pointer(&format!("/value/{column}"))) {
                record = record.with(column, v);
            }
        }
        if !record.values.is_empty() {
            out.push(record);
        }
    }
    Ok(out)
}

fn parse_sleep(body: &Value) -> Result<Vec<MetricRecord>, String> {
    // dateOfSleep -> (is main sleep, minutes in bed, record)
    let mut best: BTreeMap<NaiveDate, (bool, i64, MetricRecord)> = BTreeMap::new();

    for entry in entries(body, "sleep")? {
        let Some(date) = entry_date(entry, "dateOfSleep") else {
            continue;
        };
        let is_main = entry
            .get("isMainSleep")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let in_bed = entry.get("timeInBed").and_then(Value::as_i64).unwrap_or(0);

        let mut record = MetricRecord::new(date);
        for column in [
            "logId",
            "startTime",
            "endTime",
            "minutesAsleep",
            "minutesAwake",
            "minutesToFallAsleep",
            "timeInBed",
            "efficiency",
        ] {
            if let Some(v) = cell(entry.get(column)) {
                record = record.with(column, v);
            }
        }
        for (column, stage) in [
            ("minutesDeep", "deep"),
            ("minutesREM", "rem"),
            ("minutesLight", "light"),
            ("minutesWake", "wake"),
        ] {
            if let Some(v) = cell(entry.pointer(&format!("/levels/summary/{stage}/minutes"))) {
                record = record.with(column, v);
            }
        }

        let replace = match best.get(&date) {
            None => true,
            Some((best_main, best_bed, _)) => (is_main, in_bed) > (*best_main, *best_bed),
        };
        if replace {
            best.insert(date, (is_main, in_bed, record));
        }
    }

    Ok(best.into_values().map(|(_, _, record)| record).collect())
}
