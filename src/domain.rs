use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::IcosdpError;

pub const DATA_STORE_ID: &str = "icosdp";
pub const DATA_TYPE: &str = "dataset";
pub const DATA_OPENER_ID: &str = "dataset:zarr:icosdp";
pub const DATA_ID_PREFIX: &str = "FLUXCOM-X-BASE_";

/// First and last calendar year published in the archive.
pub const COVERAGE_START_YEAR: i32 = 2001;
pub const COVERAGE_END_YEAR: i32 = 2021;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
pub enum AggMode {
    #[serde(rename = "005_hourly")]
    #[value(name = "005_hourly")]
    Hourly005,
    #[serde(rename = "050_monthly")]
    #[value(name = "050_monthly")]
    Monthly050,
    #[serde(rename = "025_monthlycycle")]
    #[value(name = "025_monthlycycle")]
    MonthlyCycle025,
    #[serde(rename = "025_daily")]
    #[value(name = "025_daily")]
    Daily025,
    #[serde(rename = "005_monthly")]
    #[value(name = "005_monthly")]
    Monthly005,
}

impl AggMode {
    pub const ALL: [AggMode; 5] = [
        AggMode::Hourly005,
        AggMode::Monthly050,
        AggMode::MonthlyCycle025,
        AggMode::Daily025,
        AggMode::Monthly005,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AggMode::Hourly005 => "005_hourly",
            AggMode::Monthly050 => "050_monthly",
            AggMode::MonthlyCycle025 => "025_monthlycycle",
            AggMode::Daily025 => "025_daily",
            AggMode::Monthly005 => "005_monthly",
        }
    }

    fn split(self) -> (&'static str, &'static str) {
        self.as_str()
            .split_once('_')
            .unwrap_or((self.as_str(), self.as_str()))
    }

    /// Grid spacing in degrees as it appears in object names, e.g. `0.5`.
    pub fn resolution_token(self) -> String {
        let hundredths: u32 = self.split().0.parse().unwrap_or(0);
        format!("{}", f64::from(hundredths) / 100.0)
    }

    /// Frequency part of the mode token, used in cache artifact names.
    pub fn frequency(self) -> &'static str {
        self.split().1
    }

    /// Frequency phrase as written in catalog object names.
    pub fn catalog_frequency(self) -> &'static str {
        match self.frequency() {
            "monthlycycle" => "monthly diurnal cycle",
            other => other,
        }
    }

    pub fn is_preloadable(self) -> bool {
        !matches!(self, AggMode::Hourly005)
    }
}

impl fmt::Display for AggMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggMode {
    type Err = IcosdpError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        AggMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == value.trim())
            .ok_or_else(|| {
                IcosdpError::Configuration(format!(
                    "unknown aggregation mode {value:?}, expected one of {:?}",
                    AggMode::ALL.map(AggMode::as_str)
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    #[default]
    Zarr,
    Netcdf,
}

impl TargetFormat {
    pub fn extension(self) -> &'static str {
        match self {
            TargetFormat::Zarr => "zarr",
            TargetFormat::Netcdf => "nc",
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetFormat::Zarr => write!(f, "zarr"),
            TargetFormat::Netcdf => write!(f, "netcdf"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataId(String);

impl DataId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Flux variable name, e.g. `NEE` for `FLUXCOM-X-BASE_NEE`.
    pub fn variable(&self) -> &str {
        self.0.strip_prefix(DATA_ID_PREFIX).unwrap_or(&self.0)
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DataId {
    type Err = IcosdpError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let variable = trimmed.strip_prefix(DATA_ID_PREFIX).unwrap_or(trimmed);
        let is_valid = !variable.is_empty()
            && variable
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        if !is_valid {
            return Err(IcosdpError::Configuration(format!(
                "invalid data id {value:?}"
            )));
        }
        Ok(Self(format!("{DATA_ID_PREFIX}{variable}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Bbox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self, IcosdpError> {
        let bbox = Self {
            west,
            south,
            east,
            north,
        };
        let finite = [west, south, east, north].iter().all(|v| v.is_finite());
        if !finite || west >= east || south >= north {
            return Err(IcosdpError::InvalidBbox(bbox.to_string()));
        }
        Ok(bbox)
    }

    pub fn from_array(values: [f64; 4]) -> Result<Self, IcosdpError> {
        Self::new(values[0], values[1], values[2], values[3])
    }

    pub fn to_array(self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }
}

impl fmt::Display for Bbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.west, self.south, self.east, self.north
        )
    }
}

/// Inclusive calendar-year window used to filter yearly archive members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub start: i32,
    pub end: i32,
}

impl YearRange {
    pub fn new(start: i32, end: i32) -> Result<Self, IcosdpError> {
        if start > end {
            return Err(IcosdpError::InvalidTimeRange(format!("({start}, {end})")));
        }
        let covered = COVERAGE_START_YEAR..=COVERAGE_END_YEAR;
        if !covered.contains(&start) || !covered.contains(&end) {
            return Err(IcosdpError::InvalidTimeRange(format!(
                "({start}, {end}) outside archive coverage \
                 {COVERAGE_START_YEAR}-{COVERAGE_END_YEAR}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, year: i32) -> bool {
        (self.start..=self.end).contains(&year)
    }

    /// Parses a pair of ISO dates; only the year is used for filtering.
    pub fn from_dates(start: &str, end: &str) -> Result<Self, IcosdpError> {
        let start_date = parse_iso_date(start)?;
        let end_date = parse_iso_date(end)?;
        if start_date > end_date {
            return Err(IcosdpError::InvalidTimeRange(format!("({start:?}, {end:?})")));
        }
        Self::new(start_date.year(), end_date.year())
    }
}

impl fmt::Display for YearRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

pub fn parse_iso_date(value: &str) -> Result<NaiveDate, IcosdpError> {
    let trimmed = value.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| {
            NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S").map(|dt| dt.date())
        })
        .or_else(|_| NaiveDate::parse_from_str(&format!("{trimmed}-01-01"), "%Y-%m-%d"))
        .map_err(|_| IcosdpError::Configuration(format!("invalid ISO date {value:?}")))
}

pub fn parse_iso_datetime(value: &str) -> Result<NaiveDateTime, IcosdpError> {
    let trimmed = value.trim();
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| parse_iso_date(trimmed).map(|date| date.and_time(chrono::NaiveTime::MIN)))
}
