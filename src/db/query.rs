use diesel::dsl::{count, sql};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable, Text};
use serde::Serialize;

use crate::api::params::ExceedanceParams;
use crate::db::schema::{fd_list, measurements};
use crate::db::DateTimeUtc;
use crate::error::ApiError;

diesel::define_sql_function! {
    /// SQLite fallback aggregate: comma-delimited text of the grouped values.
    #[aggregate]
    fn group_concat(expr: BigInt) -> Nullable<Text>;
}

diesel::define_sql_function! {
    /// JSON1 aggregate: a real JSON array of the grouped values.
    #[aggregate]
    fn json_group_array(expr: BigInt) -> Nullable<Text>;
}

/// How the store collapses a group's frequency values into one column. The
/// raw representation never leaves this module; callers only see `Vec<i64>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyAgg {
    /// `json_group_array`, available when the store was built with JSON1.
    JsonArray,
    /// `group_concat`, available everywhere.
    Delimited,
}

impl FrequencyAgg {
    /// Probes the store for JSON1 support and picks the aggregate accordingly.
    pub fn detect(conn: &mut SqliteConnection) -> Self {
        let probe = diesel::select(sql::<Text>("json_group_array(1)")).get_result::<String>(conn);
        match probe {
            Ok(_) => FrequencyAgg::JsonArray,
            Err(_) => {
                log::warn!("store lacks JSON1, falling back to delimited frequency aggregation");
                FrequencyAgg::Delimited
            }
        }
    }

    fn parse(&self, raw: Option<&str>) -> Result<Vec<i64>, ApiError> {
        let raw = match raw {
            Some(raw) if !raw.is_empty() => raw,
            // An empty group should be filtered out by the HAVING clause, but
            // a NULL aggregate still maps to an empty list rather than a 500.
            _ => return Ok(Vec::new()),
        };

        match self {
            FrequencyAgg::JsonArray => serde_json::from_str(raw)
                .map_err(|e| ApiError::Aggregate(format!("bad JSON aggregate {raw:?}: {e}"))),
            FrequencyAgg::Delimited => raw
                .split(',')
                .map(|value| {
                    value.trim().parse::<i64>().map_err(|e| {
                        ApiError::Aggregate(format!("bad delimited aggregate {raw:?}: {e}"))
                    })
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceedanceRecord {
    pub timestamp: String,
    pub device_name: String,
    pub frequencies: Vec<i64>,
}

type AggRow = (DateTimeUtc, String, Option<String>);

/// One record per (timestamp, device) whose measurements strictly exceeded
/// the RSSI threshold inside the window, frequencies merged per group.
pub fn load_exceedances(
    conn: &mut SqliteConnection,
    agg: FrequencyAgg,
    params: &ExceedanceParams,
) -> Result<Vec<ExceedanceRecord>, ApiError> {
    load_rows(conn, agg, params)?
        .into_iter()
        .map(|row| to_record(agg, row))
        .collect()
}

fn load_rows(
    conn: &mut SqliteConnection,
    agg: FrequencyAgg,
    params: &ExceedanceParams,
) -> QueryResult<Vec<AggRow>> {
    let start = DateTimeUtc::from(params.start);
    let end = DateTimeUtc::from(params.end);

    let grouped = measurements::table
        .inner_join(fd_list::table)
        .filter(measurements::timestamp.between(start, end))
        .filter(measurements::rssi.gt(params.threshold))
        .group_by((measurements::timestamp, fd_list::name))
        // Redundant given the rssi filter above, but kept so a NULL-producing
        // group can never surface from the store.
        .having(count(measurements::frequency).gt(0_i64));

    match agg {
        FrequencyAgg::JsonArray => grouped
            .select((
                measurements::timestamp,
                fd_list::name,
                json_group_array(measurements::frequency),
            ))
            .load(conn),
        FrequencyAgg::Delimited => grouped
            .select((
                measurements::timestamp,
                fd_list::name,
                group_concat(measurements::frequency),
            ))
            .load(conn),
    }
}

fn to_record(
    agg: FrequencyAgg,
    (timestamp, device_name, raw): AggRow,
) -> Result<ExceedanceRecord, ApiError> {
    Ok(ExceedanceRecord {
        timestamp: render_timestamp(&timestamp),
        device_name,
        frequencies: agg.parse(raw.as_deref())?,
    })
}

/// Wall-clock ISO-8601 without a timezone suffix, matching what the previous
/// backend emitted for these rows.
fn render_timestamp(timestamp: &DateTimeUtc) -> String {
    if timestamp.timestamp_subsec_micros() == 0 {
        timestamp.format("%Y-%m-%dT%H:%M:%S").to_string()
    } else {
        timestamp.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    }
}
