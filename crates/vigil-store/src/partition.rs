//! Calendar-month partition math
//!
//! Pure functions mapping a timestamp to the partition that must hold it.
//! Deterministic naming is part of the external contract:
//! `<base_table>_<year>_<month>` over `[first-of-month, first-of-next)`.

use chrono::{DateTime, Datelike, NaiveDate, Utc};

use crate::error::StoreError;

/// One calendar-month partition: its name and half-open UTC range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    /// Deterministic partition/table name, e.g. `audit_logs_2024_03`
    pub name: String,
    /// First instant covered (first of the month, midnight UTC)
    pub start: DateTime<Utc>,
    /// First instant NOT covered (first of the next month, midnight UTC)
    pub end: DateTime<Utc>,
}

impl PartitionSpec {
    /// Does this partition cover the given instant?
    pub fn covers(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Compute the month partition a timestamp belongs to.
pub fn month_partition(base_table: &str, ts: DateTime<Utc>) -> Result<PartitionSpec, StoreError> {
    let year = ts.year();
    let month = ts.month();

    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };

    let start = first_of_month(year, month)?;
    let end = first_of_month(next_year, next_month)?;

    Ok(PartitionSpec {
        name: format!("{base_table}_{year:04}_{month:02}"),
        start,
        end,
    })
}

fn first_of_month(year: i32, month: u32) -> Result<DateTime<Utc>, StoreError> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| StoreError::InvalidTimestamp(format!("{year:04}-{month:02}")))
}
