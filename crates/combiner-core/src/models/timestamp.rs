use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{CoreError, Result};

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

/// A wall-clock timestamp as the CRM reports it: local date plus the zone it
/// was recorded in.
///
/// The CRM sends plain `YYYY-MM-DD HH:MM:SS` strings; snapshots written by
/// older tooling carry `{date, timezone, timezone_type}` objects. Both are
/// accepted. Plain strings are taken as UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedAt {
    pub date: String,
    pub timezone: String,
}

impl CreatedAt {
    pub fn new(date: impl Into<String>, timezone: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            timezone: timezone.into(),
        }
    }

    pub fn utc(date: impl Into<String>) -> Self {
        Self::new(date, "UTC")
    }

    /// Resolve to an absolute instant. Fails when either part is blank or
    /// unparsable, or the local time does not exist in the zone.
    pub fn instant(&self) -> Result<DateTime<Utc>> {
        let date = self.date.trim();
        let zone = self.timezone.trim();
        if date.is_empty() || zone.is_empty() {
            return Err(CoreError::InvalidTimestamp(format!("{date:?} {zone:?}")));
        }

        if let Ok(parsed) = DateTime::parse_from_rfc3339(date) {
            return Ok(parsed.with_timezone(&Utc));
        }

        let naive = DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(date, fmt).ok())
            .ok_or_else(|| CoreError::InvalidTimestamp(date.to_string()))?;

        if zone.eq_ignore_ascii_case("utc") || zone == "Z" {
            return Ok(Utc.from_utc_datetime(&naive));
        }

        if let Ok(offset) = zone.parse::<FixedOffset>() {
            return offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| CoreError::InvalidTimestamp(format!("{date} {zone}")));
        }

        let tz: chrono_tz::Tz = zone
            .parse()
            .map_err(|_| CoreError::InvalidTimestamp(format!("unknown timezone {zone}")))?;
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| CoreError::InvalidTimestamp(format!("{date} {zone}")))
    }
}

impl<'de> Deserialize<'de> for CreatedAt {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Object {
                date: String,
                #[serde(default)]
                timezone: Option<String>,
            },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(date) => CreatedAt::utc(date),
            Raw::Object { date, timezone } => CreatedAt {
                date,
                timezone: timezone.unwrap_or_default(),
            },
        })
    }
}
