//! Foreign-table option parsing.
//!
//! Option keys arrive normalized as a string map (the SQL front-end owns
//! the WITH-clause syntax). Refresh-related options are validated at
//! CREATE time; violations surface before the table exists.

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strata_common::{Error, Result};

pub const FILE_PATH_KEY: &str = "file_path";
pub const FRAGMENT_SIZE_KEY: &str = "fragment_size";
pub const REFRESH_UPDATE_TYPE_KEY: &str = "refresh_update_type";
pub const REFRESH_TIMING_TYPE_KEY: &str = "refresh_timing_type";
pub const REFRESH_START_DATE_TIME_KEY: &str = "refresh_start_date_time";
pub const REFRESH_INTERVAL_KEY: &str = "refresh_interval";

/// Rows per fragment when the table declares no `fragment_size`
pub const DEFAULT_FRAGMENT_SIZE: u64 = 32_000_000;

const START_DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How a refresh reconciles cached state with the source
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshUpdateType {
    /// Reconcile the whole table
    #[default]
    All,
    /// The source only ever grows; re-examine the last fragment and any new ones
    Append,
}

/// Whether refreshes are user-driven or fired by the scheduler
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshTimingType {
    #[default]
    Manual,
    Scheduled,
}

/// Parsed refresh options of one foreign table
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshOptions {
    pub update_type: RefreshUpdateType,
    pub timing_type: RefreshTimingType,
    /// Epoch seconds, UTC; present iff the table is scheduled
    pub start_date_time: Option<i64>,
    /// Interval between scheduled refreshes, in seconds
    pub interval_secs: Option<i64>,
}

pub fn parse_refresh_update_type(value: &str) -> Result<RefreshUpdateType> {
    match value.to_ascii_uppercase().as_str() {
        "ALL" => Ok(RefreshUpdateType::All),
        "APPEND" => Ok(RefreshUpdateType::Append),
        _ => Err(Error::InvalidRefreshUpdateType {
            value: value.to_string(),
        }),
    }
}

pub fn parse_refresh_timing_type(value: &str) -> Result<RefreshTimingType> {
    match value.to_ascii_uppercase().as_str() {
        "MANUAL" => Ok(RefreshTimingType::Manual),
        "SCHEDULED" => Ok(RefreshTimingType::Scheduled),
        _ => Err(Error::InvalidRefreshTimingType),
    }
}

/// Parse an interval of the form `<integer><S|H|D>` into seconds
pub fn parse_refresh_interval(value: &str) -> Result<i64> {
    let value = value.trim();
    if value.len() < 2 {
        return Err(Error::InvalidRefreshInterval);
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let count: i64 = digits
        .parse()
        .map_err(|_| Error::InvalidRefreshInterval)?;
    if count < 0 {
        return Err(Error::InvalidRefreshInterval);
    }
    let unit_secs = match unit.to_ascii_uppercase().as_str() {
        "S" => 1,
        "H" => 60 * 60,
        "D" => 60 * 60 * 24,
        _ => return Err(Error::InvalidRefreshInterval),
    };
    Ok(count * unit_secs)
}

/// Parse `%Y-%m-%d %H:%M:%S` as UTC epoch seconds
pub fn parse_start_date_time(value: &str) -> Result<i64> {
    let parsed = NaiveDateTime::parse_from_str(value, START_DATE_TIME_FORMAT)
        .map_err(|_| Error::InvalidDateTime {
            value: value.to_string(),
        })?;
    Ok(parsed.and_utc().timestamp())
}

/// Validate and assemble the refresh options of a table at CREATE time
pub fn parse_refresh_options(options: &BTreeMap<String, String>) -> Result<RefreshOptions> {
    let mut parsed = RefreshOptions::default();

    if let Some(value) = options.get(REFRESH_UPDATE_TYPE_KEY) {
        parsed.update_type = parse_refresh_update_type(value)?;
    }
    if let Some(value) = options.get(REFRESH_TIMING_TYPE_KEY) {
        parsed.timing_type = parse_refresh_timing_type(value)?;
    }
    if let Some(value) = options.get(REFRESH_INTERVAL_KEY) {
        parsed.interval_secs = Some(parse_refresh_interval(value)?);
    }
    if let Some(value) = options.get(REFRESH_START_DATE_TIME_KEY) {
        let start = parse_start_date_time(value)?;
        if start < Utc::now().timestamp() {
            return Err(Error::PastStartDateTime);
        }
        parsed.start_date_time = Some(start);
    }

    if parsed.timing_type == RefreshTimingType::Scheduled && parsed.start_date_time.is_none() {
        return Err(Error::MissingStartDateTime);
    }
    Ok(parsed)
}

/// Parse the WITH-clause options of a `REFRESH FOREIGN TABLES` command.
/// Returns the `evict` flag; only the `EVICT` key is recognized.
pub fn parse_refresh_command_options(options: &BTreeMap<String, String>) -> Result<bool> {
    let mut evict = false;
    for (key, value) in options {
        if key.eq_ignore_ascii_case("evict") {
            match value.to_ascii_lowercase().as_str() {
                "true" => evict = true,
                "false" => evict = false,
                _ => {
                    return Err(Error::InvalidRefreshOption {
                        value: value.to_string(),
                    })
                }
            }
        } else {
            return Err(Error::UnknownRefreshOption {
                option: key.to_ascii_uppercase(),
            });
        }
    }
    Ok(evict)
}
