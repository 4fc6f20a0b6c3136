// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Metric persistence.
//!
//! Records are keyed by `(profile, metric, date)`; writing the same date twice
//! replaces the earlier row. The CSV backend keeps one file per metric,
//! sorted by date, rewritten atomically under a per-file lock.

use crate::db::{write_atomic, ProfileLayout};
use crate::error::StoreError;
use crate::models::{Metric, MetricRecord, ProfileId};
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const DATE_COLUMN: &str = "date";

/// Counts returned by an upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    /// Dates not previously stored
    pub inserted: usize,
    /// Dates whose row was replaced
    pub updated: usize,
    /// Rows in the store after the write
    pub total: usize,
}

impl UpsertSummary {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Storage seam for fetched metric records.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Insert or replace records by date. Idempotent.
    async fn upsert(
        &self,
        profile: &ProfileId,
        metric: Metric,
        records: &[MetricRecord],
    ) -> Result<UpsertSummary, StoreError>;

    /// Latest stored date, if any.
    async fn last_date(
        &self,
        profile: &ProfileId,
        metric: Metric,
    ) -> Result<Option<NaiveDate>, StoreError>;

    /// All stored records, sorted by date.
    async fn read_all(
        &self,
        profile: &ProfileId,
        metric: Metric,
    ) -> Result<Vec<MetricRecord>, StoreError>;
}

type FileLocks = Arc<DashMap<PathBuf, Arc<Mutex<()>>>>;

/// CSV-file implementation of [`MetricStore`].
#[derive(Clone)]
pub struct CsvMetricStore {
    layout: ProfileLayout,
    locks: FileLocks,
}

impl CsvMetricStore {
    pub fn new(layout: ProfileLayout) -> Self {
        Self {
            layout,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl MetricStore for CsvMetricStore {
    async fn upsert(
        &self,
        profile: &ProfileId,
        metric: Metric,
        records: &[MetricRecord],
    ) -> Result<UpsertSummary, StoreError> {
        let path = self.layout.metric_file(profile, metric);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        let records = records.to_vec();
        let summary = tokio::task::spawn_blocking(move || upsert_file(&path, metric, records))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        tracing::debug!(
            profile_id = %profile,
            metric = %metric,
            inserted = summary.inserted,
            updated = summary.updated,
            total = summary.total,
            "Metric records upserted"
        );
        Ok(summary)
    }

    async fn last_date(
        &self,
        profile: &ProfileId,
        metric: Metric,
    ) -> Result<Option<NaiveDate>, StoreError> {
        let records = self.read_all(profile, metric).await?;
        Ok(records.last().map(|r| r.date))
    }

    async fn read_all(
        &self,
        profile: &ProfileId,
        metric: Metric,
    ) -> Result<Vec<MetricRecord>, StoreError> {
        let path = self.layout.metric_file(profile, metric);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        let table = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Table::parse(&path, &raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(table.into_records())
    }
}

fn upsert_file(
    path: &Path,
    metric: Metric,
    records: Vec<MetricRecord>,
) -> Result<UpsertSummary, StoreError> {
    let mut table = match std::fs::read_to_string(path) {
        Ok(raw) => Table::parse(path, &raw)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Table::default(),
        Err(e) => return Err(e.into()),
    };
    table.ensure_columns(metric.columns().iter().copied());

    let mut summary = UpsertSummary::default();
    for record in records {
        table.ensure_columns(record.values.keys().map(String::as_str));
        if table.rows.insert(record.date, record.values).is_some() {
            summary.updated += 1;
        } else {
            summary.inserted += 1;
        }
    }
    summary.total = table.rows.len();

    write_atomic(path, table.render().as_bytes())?;
    Ok(summary)
}

/// In-memory CSV file: header order plus rows keyed (and sorted) by date.
#[derive(Debug, Default)]
struct Table {
    columns: Vec<String>,
    rows: BTreeMap<NaiveDate, BTreeMap<String, String>>,
}

impl Table {
    fn parse(path: &Path, raw: &str) -> Result<Self, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            path: path.display().to_string(),
            reason,
        };

        let mut records = split_records(raw).into_iter();
        let Some(header) = records.next() else {
            return Ok(Self::default());
        };
        if header.first().map(String::as_str) != Some(DATE_COLUMN) {
            return Err(corrupt("first column must be 'date'".to_string()));
        }
        let columns: Vec<String> = header[1..].to_vec();

        let mut rows = BTreeMap::new();
        for (n, fields) in records.enumerate() {
            let date = fields
                .first()
                .and_then(|d| crate::time_utils::parse_date(d))
                .ok_or_else(|| corrupt(format!("row {}: bad date", n + 2)))?;
            let values = columns
                .iter()
                .zip(fields.into_iter().skip(1))
                .filter(|(_, v)| !v.is_empty())
                .map(|(c, v)| (c.clone(), v))
                .collect();
            rows.insert(date, values);
        }

        Ok(Self { columns, rows })
    }

    fn ensure_columns<'a>(&mut self, names: impl Iterator<Item = &'a str>) {
        for name in names {
            if name != DATE_COLUMN && !self.columns.iter().any(|c| c == name) {
                self.columns.push(name.to_string());
            }
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(DATE_COLUMN);
        for column in &self.columns {
            out.push(',');
            out.push_str(&escape(column));
        }
        out.push('\n');

        for (date, values) in &self.rows {
            out.push_str(&date.format("%Y-%m-%d").to_string());
            for column in &self.columns {
                out.push(',');
                if let Some(value) = values.get(column) {
                    out.push_str(&escape(value));
                }
            }
            out.push('\n');
        }
        out
    }

    fn into_records(self) -> Vec<MetricRecord> {
        self.rows
            .into_iter()
            .map(|(date, values)| MetricRecord { date, values })
            .collect()
    }
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split CSV text into records, honoring double-quoted fields. A quoted
/// field may span lines. Blank lines are dropped.
fn split_records(raw: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', _) => quoted = !quoted,
            (',', false) => fields.push(std::mem::take(&mut current)),
            ('\r', false) if chars.peek() == Some(&'\n') => {}
            ('\n', false) => {
                fields.push(std::mem::take(&mut current));
                records.push(std::mem::take(&mut fields));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() || !fields.is_empty() {
        fields.push(current);
        records.push(fields);
    }
    records.retain(|r| !(r.len() == 1 && r[0].trim().is_empty()));
    records
}
