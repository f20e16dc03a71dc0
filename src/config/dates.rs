// src/config/dates.rs
//! Download window resolution. Dates are either absolute (`2010-01-01`) or
//! relative to today (`0d`, `-1day`, `-2w`, `-3m`, `-1y`).

use chrono::{Days, Months, NaiveDate};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::settings::PipelineSettings;
use crate::error::{PipelineError, Result};

/// Download options as carried in the pipeline state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_end_date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DownloadWindow {
    /// Resolve from the state options, falling back to the settings. A missing
    /// or unparsable date is a configuration error.
    pub fn resolve(
        options: &DownloadOptions,
        settings: &PipelineSettings,
        today: NaiveDate,
    ) -> Result<Self> {
        let start = pick(
            options.download_start_date.as_deref(),
            settings.default_download_start.as_deref(),
            "downloadStartDate",
            today,
        )?;
        let end = pick(
            options.download_end_date.as_deref(),
            settings.default_download_end.as_deref(),
            "downloadEndDate",
            today,
        )?;
        if start > end {
            return Err(PipelineError::EmptyDownloadWindow { start, end });
        }
        Ok(Self { start, end })
    }
}

fn pick(
    given: Option<&str>,
    fallback: Option<&str>,
    field: &'static str,
    today: NaiveDate,
) -> Result<NaiveDate> {
    let raw = given
        .filter(|s| !s.trim().is_empty())
        .or(fallback)
        .ok_or(PipelineError::MissingSetting(field))?;
    parse_date(raw, today).ok_or_else(|| PipelineError::InvalidSetting {
        field,
        value: raw.to_string(),
    })
}

/// Parse an absolute or relative date expression.
pub fn parse_date(raw: &str, today: NaiveDate) -> Option<NaiveDate> {
    let s = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }

    static RE_REL: OnceCell<Regex> = OnceCell::new();
    let re = RE_REL.get_or_init(|| {
        Regex::new(r"(?i)^([+-]?\d+)\s*(d|days?|w|weeks?|m|months?|y|years?)$")
            .expect("relative date regex")
    });
    let caps = re.captures(s)?;
    let amount: i64 = caps[1].parse().ok()?;
    let unit = caps[2].to_ascii_lowercase();
    let magnitude = amount.unsigned_abs();

    match unit.chars().next()? {
        'd' => shift_days(today, amount.signum(), magnitude),
        'w' => shift_days(today, amount.signum(), magnitude.checked_mul(7)?),
        'm' => shift_months(today, amount.signum(), magnitude),
        'y' => shift_months(today, amount.signum(), magnitude.checked_mul(12)?),
        _ => None,
    }
}

fn shift_days(d: NaiveDate, sign: i64, n: u64) -> Option<NaiveDate> {
    if sign < 0 {
        d.checked_sub_days(Days::new(n))
    } else {
        d.checked_add_days(Days::new(n))
    }
}

fn shift_months(d: NaiveDate, sign: i64, n: u64) -> Option<NaiveDate> {
    let n = Months::new(u32::try_from(n).ok()?);
    if sign < 0 {
        d.checked_sub_months(n)
    } else {
        d.checked_add_months(n)
    }
}
