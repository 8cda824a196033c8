use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::CoreError;
use super::asset::InstrumentType;
use super::internal_id::InternalId;
use super::quote::{QuoteFailure, QuoteSource};

/// Coarse history window accepted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HistoryRange {
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "5d")]
    FiveDays,
    #[serde(rename = "1mo")]
    OneMonth,
    #[serde(rename = "3mo")]
    ThreeMonths,
    #[serde(rename = "6mo")]
    SixMonths,
    #[serde(rename = "1y")]
    OneYear,
    #[serde(rename = "5y")]
    FiveYears,
}

impl HistoryRange {
    pub const ALL: [HistoryRange; 7] = [
        HistoryRange::OneDay,
        HistoryRange::FiveDays,
        HistoryRange::OneMonth,
        HistoryRange::ThreeMonths,
        HistoryRange::SixMonths,
        HistoryRange::OneYear,
        HistoryRange::FiveYears,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HistoryRange::OneDay => "1d",
            HistoryRange::FiveDays => "5d",
            HistoryRange::OneMonth => "1mo",
            HistoryRange::ThreeMonths => "3mo",
            HistoryRange::SixMonths => "6mo",
            HistoryRange::OneYear => "1y",
            HistoryRange::FiveYears => "5y",
        }
    }

    /// Calendar days spanned by the window (5 trading days span a week).
    pub fn days(self) -> i64 {
        match self {
            HistoryRange::OneDay => 1,
            HistoryRange::FiveDays => 7,
            HistoryRange::OneMonth => 31,
            HistoryRange::ThreeMonths => 92,
            HistoryRange::SixMonths => 183,
            HistoryRange::OneYear => 366,
            HistoryRange::FiveYears => 1827,
        }
    }

    pub fn is_intraday(self) -> bool {
        matches!(self, HistoryRange::OneDay | HistoryRange::FiveDays)
    }

    pub fn default_interval(self) -> Interval {
        let token = match self {
            HistoryRange::OneDay => "5m",
            HistoryRange::FiveDays => "15m",
            HistoryRange::OneMonth
            | HistoryRange::ThreeMonths
            | HistoryRange::SixMonths
            | HistoryRange::OneYear => "1d",
            HistoryRange::FiveYears => "1wk",
        };
        Interval(token.to_string())
    }

    /// Smallest range reaching `days_back` calendar days into the past.
    pub fn covering(days_back: i64) -> Option<HistoryRange> {
        Self::ALL.into_iter().find(|r| r.days() >= days_back.max(0))
    }
}

impl fmt::Display for HistoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryRange {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == token)
            .ok_or_else(|| CoreError::InvalidRequest(format!("unsupported range '{s}'")))
    }
}

/// Sampling interval token, validated against what the upstreams accept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Interval(String);

const INTERVAL_TOKENS: &[&str] = &[
    "1m", "2m", "5m", "15m", "30m", "60m", "90m", "1h", "1d", "5d", "1wk", "1mo", "3mo",
];

impl Interval {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_daily_or_coarser(&self) -> bool {
        matches!(self.0.as_str(), "1d" | "5d" | "1wk" | "1mo" | "3mo")
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Interval {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_lowercase();
        if INTERVAL_TOKENS.contains(&token.as_str()) {
            Ok(Interval(token))
        } else {
            Err(CoreError::InvalidRequest(format!("unsupported interval '{s}'")))
        }
    }
}

impl TryFrom<String> for Interval {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.0
    }
}

/// A single point of a history series. Serialized as `{t, v}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    /// Unix time in milliseconds.
    #[serde(rename = "t")]
    pub timestamp_ms: i64,
    #[serde(rename = "v")]
    pub value: f64,
}

/// Raw series as returned by an adapter, before normalization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProviderHistory {
    pub symbol: String,
    pub points: Vec<HistoryPoint>,
    pub currency: Option<String>,
    pub instrument_type: InstrumentType,
}

/// Normalized history series, points ascending by time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistorySeries {
    pub id: String,
    pub points: Vec<HistoryPoint>,
    pub currency: String,
    pub source: QuoteSource,
}

impl HistorySeries {
    /// Point closest in time to `target_ms`; on a tie the earlier point wins.
    pub fn nearest(&self, target_ms: i64) -> Option<&HistoryPoint> {
        // points are sorted, so the candidates straddle the insertion index
        let idx = self.points.partition_point(|p| p.timestamp_ms < target_ms);
        let before = idx.checked_sub(1).and_then(|i| self.points.get(i));
        let after = self.points.get(idx);
        match (before, after) {
            (Some(b), Some(a)) => {
                let db = (target_ms - b.timestamp_ms).unsigned_abs();
                let da = (a.timestamp_ms - target_ms).unsigned_abs();
                Some(if da < db { a } else { b })
            }
            (Some(b), None) => Some(b),
            (None, a) => a,
        }
    }

    pub fn latest(&self) -> Option<&HistoryPoint> {
        self.points.last()
    }

    /// Points as a finite sequence; the series is not a live stream.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryPoint> {
        self.points.iter()
    }
}

/// History response slot: series or `{id, error}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HistoryResult {
    Ok(HistorySeries),
    Err(QuoteFailure),
}

impl HistoryResult {
    pub fn failure(id: impl Into<String>, err: &CoreError) -> Self {
        HistoryResult::Err(QuoteFailure::new(id, err))
    }

    pub fn series(&self) -> Option<&HistorySeries> {
        match self {
            HistoryResult::Ok(s) => Some(s),
            HistoryResult::Err(_) => None,
        }
    }

    pub fn error(&self) -> Option<&QuoteFailure> {
        match self {
            HistoryResult::Ok(_) => None,
            HistoryResult::Err(f) => Some(f),
        }
    }
}

/// Nearest point of a resolved series to a target instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub id: InternalId,
    pub timestamp_ms: i64,
    pub value: f64,
    pub currency: String,
    pub source: QuoteSource,
}
