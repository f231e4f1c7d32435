use std::collections::BTreeSet;
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CleanerError;

/// How often a scenario fires. Weekdays use 0 = Sunday .. 6 = Saturday.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cadence {
    Once,
    Hourly,
    Daily,
    Weekly { weekdays: BTreeSet<u8> },
    Monthly { day_of_month: u32 },
}

impl Cadence {
    pub fn kind(&self) -> &'static str {
        match self {
            Cadence::Once => "once",
            Cadence::Hourly => "hourly",
            Cadence::Daily => "daily",
            Cadence::Weekly { .. } => "weekly",
            Cadence::Monthly { .. } => "monthly",
        }
    }

    pub fn weekly<I: IntoIterator<Item = u8>>(weekdays: I) -> Self {
        Cadence::Weekly {
            weekdays: weekdays.into_iter().collect(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Cadence::Weekly { weekdays } => {
                if weekdays.is_empty() {
                    return Err("weekly schedule needs at least one weekday".into());
                }
                if let Some(bad) = weekdays.iter().find(|d| **d > 6) {
                    return Err(format!("weekday {} out of range 0-6", bad));
                }
                Ok(())
            }
            Cadence::Monthly { day_of_month } if !(1..=31).contains(day_of_month) => {
                Err(format!("day_of_month {} out of range 1-31", day_of_month))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// A persisted cleaning schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScenarioRecord", into = "ScenarioRecord")]
pub struct Scenario {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub cadence: Cadence,
    /// Wall-clock time of day; minutes precision.
    pub time: NaiveTime,
    pub browsers: Vec<String>,
    pub delete_bookmarks: bool,
    pub delete_downloads: bool,
    pub delete_downloads_folder: bool,
    pub created_at: NaiveDateTime,
    pub last_run: Option<NaiveDateTime>,
    pub description: String,
}

impl Scenario {
    pub fn from_draft(draft: ScenarioDraft, now: NaiveDateTime) -> Result<Self, CleanerError> {
        let scenario = Scenario {
            id: Uuid::new_v4().to_string(),
            name: draft.name,
            enabled: true,
            cadence: draft.cadence,
            time: draft.time,
            browsers: draft.browsers,
            delete_bookmarks: draft.delete_bookmarks,
            delete_downloads: draft.delete_downloads,
            delete_downloads_folder: draft.delete_downloads_folder,
            created_at: now,
            last_run: None,
            description: draft.description,
        };
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<(), CleanerError> {
        if self.id.trim().is_empty() {
            return Err(CleanerError::InvalidScenario("empty id".into()));
        }
        if self.name.trim().is_empty() {
            return Err(CleanerError::InvalidScenario(format!(
                "scenario {} has an empty name",
                self.id
            )));
        }
        self.cadence
            .validate()
            .map_err(|reason| CleanerError::InvalidScenario(format!("{}: {}", self.name, reason)))
    }

    pub fn apply(&mut self, patch: ScenarioPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(cadence) = patch.cadence {
            self.cadence = cadence;
        }
        if let Some(time) = patch.time {
            self.time = time;
        }
        if let Some(browsers) = patch.browsers {
            self.browsers = browsers;
        }
        if let Some(v) = patch.delete_bookmarks {
            self.delete_bookmarks = v;
        }
        if let Some(v) = patch.delete_downloads {
            self.delete_downloads = v;
        }
        if let Some(v) = patch.delete_downloads_folder {
            self.delete_downloads_folder = v;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
    }
}

/// Input for creating a scenario; id, timestamps and `enabled` are assigned.
#[derive(Debug, Clone)]
pub struct ScenarioDraft {
    pub name: String,
    pub cadence: Cadence,
    pub time: NaiveTime,
    pub browsers: Vec<String>,
    pub delete_bookmarks: bool,
    pub delete_downloads: bool,
    pub delete_downloads_folder: bool,
    pub description: String,
}

impl ScenarioDraft {
    pub fn new(name: impl Into<String>, cadence: Cadence, time: NaiveTime) -> Self {
        ScenarioDraft {
            name: name.into(),
            cadence,
            time,
            browsers: Vec::new(),
            delete_bookmarks: false,
            delete_downloads: false,
            delete_downloads_folder: false,
            description: String::new(),
        }
    }

    pub fn browsers<I, S>(mut self, browsers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.browsers = browsers.into_iter().map(Into::into).collect();
        self
    }
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ScenarioPatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub cadence: Option<Cadence>,
    pub time: Option<NaiveTime>,
    pub browsers: Option<Vec<String>>,
    pub delete_bookmarks: Option<bool>,
    pub delete_downloads: Option<bool>,
    pub delete_downloads_folder: Option<bool>,
    pub description: Option<String>,
}

/// Flat on-disk shape of a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ScenarioRecord {
    id: String,
    name: String,
    enabled: bool,
    schedule_type: String,
    time: String,
    #[serde(default)]
    weekdays: Vec<u8>,
    #[serde(default)]
    day_of_month: Option<u32>,
    #[serde(default)]
    browsers: Vec<String>,
    #[serde(default)]
    delete_bookmarks: bool,
    #[serde(default)]
    delete_downloads: bool,
    #[serde(default)]
    delete_downloads_folder: bool,
    created_at: NaiveDateTime,
    #[serde(default)]
    last_run: Option<NaiveDateTime>,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScheduleKind {
    Once,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(ScheduleKind::Once),
            "hourly" => Ok(ScheduleKind::Hourly),
            "daily" => Ok(ScheduleKind::Daily),
            "weekly" => Ok(ScheduleKind::Weekly),
            "monthly" => Ok(ScheduleKind::Monthly),
            other => Err(format!("unknown schedule_type '{}'", other)),
        }
    }
}

/// Accepts `HH:MM` and `HH:MM:SS`; seconds are dropped since fires are
/// minute-aligned.
pub fn parse_time(raw: &str) -> Result<NaiveTime, String> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
        .and_then(|t| t.with_second(0))
        .ok_or_else(|| format!("time '{}' is not HH:MM", raw))
}

impl TryFrom<ScenarioRecord> for Scenario {
    type Error = String;

    fn try_from(r: ScenarioRecord) -> Result<Self, Self::Error> {
        let kind: ScheduleKind = r.schedule_type.parse()?;
        if kind != ScheduleKind::Weekly && !r.weekdays.is_empty() {
            return Err(format!("weekdays set on a {} schedule", r.schedule_type));
        }
        if kind != ScheduleKind::Monthly && r.day_of_month.is_some() {
            return Err(format!("day_of_month set on a {} schedule", r.schedule_type));
        }
        let cadence = match kind {
            ScheduleKind::Once => Cadence::Once,
            ScheduleKind::Hourly => Cadence::Hourly,
            ScheduleKind::Daily => Cadence::Daily,
            ScheduleKind::Weekly => Cadence::weekly(r.weekdays),
            ScheduleKind::Monthly => Cadence::Monthly {
                day_of_month: r
                    .day_of_month
                    .ok_or_else(|| "monthly schedule without day_of_month".to_string())?,
            },
        };

        let scenario = Scenario {
            time: parse_time(&r.time)?,
            id: r.id,
            name: r.name,
            enabled: r.enabled,
            cadence,
            browsers: r.browsers,
            delete_bookmarks: r.delete_bookmarks,
            delete_downloads: r.delete_downloads,
            delete_downloads_folder: r.delete_downloads_folder,
            created_at: r.created_at,
            last_run: r.last_run,
            description: r.description,
        };
        scenario.validate().map_err(|e| e.to_string())?;
        Ok(scenario)
    }
}

impl From<Scenario> for ScenarioRecord {
    fn from(s: Scenario) -> Self {
        let schedule_type = s.cadence.kind().to_string();
        let (weekdays, day_of_month) = match s.cadence {
            Cadence::Weekly { weekdays } => (weekdays.into_iter().collect(), None),
            Cadence::Monthly { day_of_month } => (Vec::new(), Some(day_of_month)),
            _ => (Vec::new(), None),
        };
        ScenarioRecord {
            id: s.id,
            name: s.name,
            enabled: s.enabled,
            schedule_type,
            time: s.time.format("%H:%M").to_string(),
            weekdays,
            day_of_month,
            browsers: s.browsers,
            delete_bookmarks: s.delete_bookmarks,
            delete_downloads: s.delete_downloads,
            delete_downloads_folder: s.delete_downloads_folder,
            created_at: s.created_at,
            last_run: s.last_run,
            description: s.description,
        }
    }
}
