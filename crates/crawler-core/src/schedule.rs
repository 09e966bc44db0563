use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CrawlerError, Result};

/// Shorthand recurrences accepted in place of a cron expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleFrequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl ScheduleFrequency {
    /// Five-field cron equivalent (UTC).
    pub fn cron_expression(&self) -> &'static str {
        match self {
            ScheduleFrequency::Hourly => "0 * * * *",
            ScheduleFrequency::Daily => "0 0 * * *",
            ScheduleFrequency::Weekly => "0 0 * * Sun",
            ScheduleFrequency::Monthly => "0 0 1 * *",
        }
    }
}

/// Recurrence as persisted on a data source.
///
/// `cron_expression` is the single source of truth; frequencies are resolved
/// into it before anything is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlSchedule {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
}

impl CrawlSchedule {
    /// Manual-only: the scheduler never picks the source up.
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self {
            enabled: true,
            cron_expression: Some(expression.into()),
        }
    }

    /// The expression to evaluate, if the scheduler should consider this source.
    pub fn active_expression(&self) -> Option<&str> {
        if self.enabled {
            self.cron_expression.as_deref()
        } else {
            None
        }
    }
}

/// Schedule as supplied by a caller, before resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub frequency: Option<ScheduleFrequency>,
}

impl ScheduleSpec {
    pub fn cron(expression: impl Into<String>) -> Self {
        Self {
            enabled: true,
            cron_expression: Some(expression.into()),
            frequency: None,
        }
    }

    pub fn every(frequency: ScheduleFrequency) -> Self {
        Self {
            enabled: true,
            cron_expression: None,
            frequency: Some(frequency),
        }
    }

    /// Resolve into a storable schedule. An explicit cron expression wins
    /// over a frequency; whichever is chosen must parse.
    pub fn resolve(self) -> Result<CrawlSchedule> {
        let expression = self
            .cron_expression
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .or_else(|| self.frequency.map(|f| f.cron_expression().to_string()));

        match expression {
            Some(expr) => {
                parse_cron(&expr)?;
                Ok(CrawlSchedule {
                    enabled: self.enabled,
                    cron_expression: Some(expr),
                })
            }
            None if self.enabled => Err(CrawlerError::validation(
                "an enabled schedule needs a cron_expression or a frequency",
            )),
            None => Ok(CrawlSchedule::manual()),
        }
    }
}

/// Normalize a 5-field cron expression to the 6-field form (leading seconds)
/// the `cron` crate expects. Six- and seven-field input passes through.
pub fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(&normalize_cron(expression)).map_err(|e| {
        CrawlerError::InvalidSchedule {
            expression: expression.to_string(),
            reason: e.to_string(),
        }
    })
}

/// First occurrence of `expression` strictly after `anchor`.
///
/// Returns `None` when the expression has no future occurrence
/// (e.g. a year field in the past).
pub fn next_due(expression: &str, anchor: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    Ok(parse_cron(expression)?.after(&anchor).next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn five_field_gets_a_seconds_column() {
        assert_eq!(normalize_cron("0 */6 * * *"), "0 0 */6 * * *");
        assert_eq!(normalize_cron(" 30 0 0 * * * "), "30 0 0 * * *");
    }

    #[test]
    fn next_due_is_strictly_after_the_anchor() {
        assert_eq!(next_due("*/15 * * * *", at(10, 7)).unwrap(), Some(at(10, 15)));
        assert_eq!(next_due("*/15 * * * *", at(10, 15)).unwrap(), Some(at(10, 30)));
    }

    #[test]
    fn explicit_cron_wins_over_frequency() {
        let spec = ScheduleSpec {
            enabled: true,
            cron_expression: Some("0 */12 * * *".into()),
            frequency: Some(ScheduleFrequency::Hourly),
        };
        let resolved = spec.resolve().unwrap();
        assert_eq!(resolved.cron_expression.as_deref(), Some("0 */12 * * *"));
    }

    #[test]
    fn frequencies_resolve_to_parseable_expressions() {
        for f in [
            ScheduleFrequency::Hourly,
            ScheduleFrequency::Daily,
            ScheduleFrequency::Weekly,
            ScheduleFrequency::Monthly,
        ] {
            let resolved = ScheduleSpec::every(f).resolve().unwrap();
            assert_eq!(resolved.active_expression(), Some(f.cron_expression()));
        }
    }

    #[test]
    fn enabled_without_expression_is_rejected() {
        let spec = ScheduleSpec {
            enabled: true,
            ..ScheduleSpec::default()
        };
        assert!(spec.resolve().is_err());
        assert_eq!(ScheduleSpec::default().resolve().unwrap(), CrawlSchedule::manual());
    }

    #[test]
    fn garbage_expression_is_rejected() {
        let err = ScheduleSpec::cron("every tuesday").resolve().unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn disabled_schedule_keeps_its_expression_but_is_inactive() {
        let spec = ScheduleSpec {
            enabled: false,
            cron_expression: Some("0 0 * * *".into()),
            frequency: None,
        };
        let resolved = spec.resolve().unwrap();
        assert_eq!(resolved.cron_expression.as_deref(), Some("0 0 * * *"));
        assert_eq!(resolved.active_expression(), None);
    }
}
