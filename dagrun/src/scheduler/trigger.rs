//! Trigger specifications and their firing times.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Error, Result};

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire once at `at`.
    Once { at: DateTime<Utc> },
    /// Fire at `start + k * every_secs` for every `k >= 1`.
    ///
    /// The start instant itself never fires. Without `start_at`, the
    /// schedule's creation time is the start.
    Interval {
        every_secs: u64,
        #[serde(default)]
        start_at: Option<DateTime<Utc>>,
    },
    /// Six- or seven-field cron expression (seconds first), evaluated in
    /// `timezone` (UTC when absent).
    Cron {
        expression: String,
        #[serde(default)]
        timezone: Option<String>,
    },
}

impl Trigger {
    pub fn once(at: DateTime<Utc>) -> Self {
        Self::Once { at }
    }

    pub fn every(every_secs: u64) -> Self {
        Self::Interval {
            every_secs,
            start_at: None,
        }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
            timezone: None,
        }
    }

    /// Reject malformed triggers.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Once { .. } => Ok(()),
            Self::Interval { every_secs, .. } => {
                if *every_secs == 0 {
                    return Err(Error::schedule("interval must be at least one second"));
                }
                if i64::try_from(*every_secs).is_err() {
                    return Err(Error::schedule("interval is too large"));
                }
                Ok(())
            }
            Self::Cron {
                expression,
                timezone,
            } => {
                parse_cron(expression)?;
                parse_timezone(timezone.as_deref())?;
                Ok(())
            }
        }
    }

    /// First firing of a schedule created at `anchor`.
    ///
    /// A one-shot trigger in the past fires on the next tick.
    pub fn first_fire(&self, anchor: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            Self::Once { at } => Ok(Some(*at)),
            _ => self.next_after(anchor, anchor),
        }
    }

    /// First firing strictly after `after`. `anchor` is the interval start
    /// when the trigger has none of its own.
    pub fn next_after(
        &self,
        after: DateTime<Utc>,
        anchor: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        match self {
            Self::Once { at } => Ok((*at > after).then_some(*at)),
            Self::Interval {
                every_secs,
                start_at,
            } => {
                let start = start_at.unwrap_or(anchor);
                let every_ms = i64::try_from(*every_secs)
                    .ok()
                    .and_then(|s| s.checked_mul(1000))
                    .ok_or_else(|| Error::schedule("interval is too large"))?;
                if every_ms <= 0 {
                    return Err(Error::schedule("interval must be at least one second"));
                }
                let k = if after < start {
                    1
                } else {
                    (after - start).num_milliseconds() / every_ms + 1
                };
                Ok(start.checked_add_signed(Duration::milliseconds(every_ms.saturating_mul(k))))
            }
            Self::Cron {
                expression,
                timezone,
            } => {
                let schedule = parse_cron(expression)?;
                let tz = parse_timezone(timezone.as_deref())?;
                Ok(schedule
                    .after(&after.with_timezone(&tz))
                    .next()
                    .map(|t| t.with_timezone(&Utc)))
            }
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::Once { .. })
    }
}

fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(expression)
        .map_err(|e| Error::schedule(format!("invalid cron expression '{}': {}", expression, e)))
}

fn parse_timezone(timezone: Option<&str>) -> Result<Tz> {
    match timezone {
        Some(tz) => tz
            .parse()
            .map_err(|_| Error::schedule(format!("'{}' is not a valid IANA timezone", tz))),
        None => Ok(chrono_tz::UTC),
    }
}

/// What to do with firings missed while the process was down.
///
/// There is no default; every schedule states its policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissedFirePolicy {
    /// Submit one replay job, however many firings were missed.
    CatchUp,
    /// Drop missed firings and continue from now.
    FireFromNow,
}
