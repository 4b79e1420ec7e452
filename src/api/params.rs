use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::error::{ApiError, FieldError};

const RSSI_MIN: i32 = -100;
const RSSI_MAX: i32 = 0;

/// Raw query string fields, untouched by serde beyond string extraction so
/// that every constraint is reported per field instead of as one opaque 400.
#[derive(Debug, Default, Deserialize)]
pub struct RawExceedanceParams {
    pub start_datetime: Option<String>,
    pub end_datetime: Option<String>,
    pub rssi_threshold: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceedanceParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub threshold: i32,
}

impl RawExceedanceParams {
    /// Field-level checks run independently so a caller sees every broken
    /// field at once; the window-ordering check only runs once both
    /// datetimes parsed on their own.
    pub fn validate(&self) -> Result<ExceedanceParams, ApiError> {
        let mut errors = Vec::new();

        let start = parse_datetime_field(&mut errors, "start_datetime", &self.start_datetime);
        let end = parse_datetime_field(&mut errors, "end_datetime", &self.end_datetime);
        let threshold = parse_threshold(&mut errors, &self.rssi_threshold);

        if let (Some(start), Some(end)) = (start, end) {
            if end < start {
                errors.push(FieldError::new(
                    "end_datetime",
                    "end_datetime must be after start_datetime",
                ));
            }
        }

        match (start, end, threshold) {
            (Some(start), Some(end), Some(threshold)) if errors.is_empty() => {
                Ok(ExceedanceParams {
                    start,
                    end,
                    threshold,
                })
            }
            _ => Err(ApiError::Validation(errors)),
        }
    }
}

fn parse_datetime_field(
    errors: &mut Vec<FieldError>,
    field: &'static str,
    value: &Option<String>,
) -> Option<DateTime<Utc>> {
    let raw = match value {
        Some(raw) => raw,
        None => {
            errors.push(FieldError::new(field, "field is required"));
            return None;
        }
    };

    match parse_datetime(raw) {
        Some(instant) => Some(instant),
        None => {
            errors.push(FieldError::new(
                field,
                format!("{raw:?} is not an ISO-8601 datetime"),
            ));
            None
        }
    }
}

/// Accepts RFC 3339 with an offset, or a naive ISO datetime taken as UTC.
fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Some(instant.with_timezone(&Utc));
    }

    raw.parse::<NaiveDateTime>()
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_threshold(errors: &mut Vec<FieldError>, value: &Option<String>) -> Option<i32> {
    let raw = match value {
        Some(raw) => raw,
        None => {
            errors.push(FieldError::new("rssi_threshold", "field is required"));
            return None;
        }
    };

    let threshold = match raw.trim().parse::<i32>() {
        Ok(threshold) => threshold,
        Err(_) => {
            errors.push(FieldError::new(
                "rssi_threshold",
                format!("{raw:?} is not an integer"),
            ));
            return None;
        }
    };

    if threshold < RSSI_MIN {
        errors.push(FieldError::new(
            "rssi_threshold",
            format!("must be greater than or equal to {RSSI_MIN}"),
        ));
        return None;
    }
    if threshold > RSSI_MAX {
        errors.push(FieldError::new(
            "rssi_threshold",
            format!("must be less than or equal to {RSSI_MAX}"),
        ));
        return None;
    }

    Some(threshold)
}
