//! Domain entities served through the data-access facade.
//!
//! Every entity carries the id of its owning account (`profile_id`). Field
//! names serialize as snake_case and double as the column names used by list
//! filters and changefeed subscriptions.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::demo::DemoDataset;
use crate::error::FieldError;
use crate::validation::ValidationMode;

/// The entity collections the facade knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Player,
    Team,
    Match,
    ClubData,
    Attendance,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Player,
        EntityKind::Team,
        EntityKind::Match,
        EntityKind::ClubData,
        EntityKind::Attendance,
    ];

    /// Table name; also the cache-key namespace for this kind.
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Player => "players",
            EntityKind::Team => "teams",
            EntityKind::Match => "matches",
            EntityKind::ClubData => "club_data",
            EntityKind::Attendance => "attendance",
        }
    }

    /// REST collection path.
    pub fn path(self) -> &'static str {
        match self {
            EntityKind::Player => "/players",
            EntityKind::Team => "/teams",
            EntityKind::Match => "/matches",
            EntityKind::ClubData => "/club-data",
            EntityKind::Attendance => "/attendance",
        }
    }

    /// Cross-tab broadcast channel name.
    pub fn channel_name(self) -> String {
        format!("statsor_{}", self.table())
    }

    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.table() == table)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Player => "player",
            EntityKind::Team => "team",
            EntityKind::Match => "match",
            EntityKind::ClubData => "club data",
            EntityKind::Attendance => "attendance record",
        };
        f.write_str(name)
    }
}

/// Equality filter on a single column, e.g. `team_id = T1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListFilter {
    pub column: String,
    pub value: String,
}

impl ListFilter {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Parse `column=value`.
    pub fn parse(s: &str) -> Option<Self> {
        let (column, value) = s.split_once('=')?;
        let column = column.trim();
        if column.is_empty() {
            return None;
        }
        Some(Self::new(column, value.trim()))
    }

    /// Check a row against this filter by its serialized column value.
    pub fn matches<E: Serialize>(&self, entity: &E) -> bool {
        let Ok(serde_json::Value::Object(row)) = serde_json::to_value(entity) else {
            return false;
        };
        match row.get(&self.column) {
            Some(serde_json::Value::String(s)) => *s == self.value,
            Some(serde_json::Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

impl fmt::Display for ListFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.column, self.value)
    }
}

/// Partial payload for `add`/`update`.
pub trait Draft: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Every field-level violation in this payload.
    fn validate(&self, mode: ValidationMode) -> Vec<FieldError>;
}

/// A record type stored in one table and scoped to one account.
pub trait Entity: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Draft: Draft;

    const KIND: EntityKind;

    fn id(&self) -> &str;

    fn profile_id(&self) -> &str;

    /// Build a new row from a validated create payload (demo mode only; the
    /// REST backend assigns ids itself).
    fn from_draft(id: String, profile_id: String, draft: Self::Draft) -> Self;

    /// Apply a validated partial update in place.
    fn apply(&mut self, draft: Self::Draft);

    /// This kind's rows in the demo dataset.
    fn rows(data: &DemoDataset) -> &Vec<Self>;

    fn rows_mut(data: &mut DemoDataset) -> &mut Vec<Self>;
}

// ============================================================================
// Player
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: String,
    pub profile_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    pub name: String,
    pub position: String,
    #[serde(default)]
    pub jersey_number: Option<i32>,
    #[serde(default)]
    pub age: Option<i32>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub nationality: Option<String>,
    #[serde(default)]
    pub goals: u32,
    #[serde(default)]
    pub assists: u32,
    #[serde(default)]
    pub matches_played: u32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jersey_number: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nationality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goals: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assists: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches_played: Option<u32>,
}

impl PlayerDraft {
    pub fn new(name: impl Into<String>, position: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            position: Some(position.into()),
            ..Default::default()
        }
    }
}

impl Entity for Player {
    type Draft = PlayerDraft;

    const KIND: EntityKind = EntityKind::Player;

    fn id(&self) -> &str {
        &self.id
    }

    fn profile_id(&self) -> &str {
        &self.profile_id
    }

    fn from_draft(id: String, profile_id: String, draft: PlayerDraft) -> Self {
        let now = Utc::now();
        Self {
            id,
            profile_id,
            team_id: draft.team_id,
            name: draft.name.unwrap_or_default(),
            position: draft.position.unwrap_or_default(),
            jersey_number: draft.jersey_number,
            age: draft.age,
            email: draft.email,
            nationality: draft.nationality,
            goals: draft.goals.unwrap_or(0),
            assists: draft.assists.unwrap_or(0),
            matches_played: draft.matches_played.unwrap_or(0),
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    fn apply(&mut self, draft: PlayerDraft) {
        if let Some(name) = draft.name {
            self.name = name;
        }
        if let Some(position) = draft.position {
            self.position = position;
        }
        if draft.team_id.is_some() {
            self.team_id = draft.team_id;
        }
        if draft.jersey_number.is_some() {
            self.jersey_number = draft.jersey_number;
        }
        if draft.age.is_some() {
            self.age = draft.age;
        }
        if draft.email.is_some() {
            self.email = draft.email;
        }
        if draft.nationality.is_some() {
            self.nationality = draft.nationality;
        }
        if let Some(goals) = draft.goals {
            self.goals = goals;
        }
        if let Some(assists) = draft.assists {
            self.assists = assists;
        }
        if let Some(matches_played) = draft.matches_played {
            self.matches_played = matches_played;
        }
        self.updated_at = Some(Utc::now());
    }

    fn rows(data: &DemoDataset) -> &Vec<Self> {
        &data.players
    }

    fn rows_mut(data: &mut DemoDataset) -> &mut Vec<Self> {
        &mut data.players
    }
}

// ============================================================================
// Team
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub profile_id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub formation: Option<String>,
    #[serde(default)]
    pub founded: Option<i32>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub founded: Option<i32>,
}

impl TeamDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

impl Entity for Team {
    type Draft = TeamDraft;

    const KIND: EntityKind = EntityKind::Team;

    fn id(&self) -> &str {
        &self.id
    }

    fn profile_id(&self) -> &str {
        &self.profile_id
    }

    fn from_draft(id: String, profile_id: String, draft: TeamDraft) -> Self {
        Self {
            id,
            profile_id,
            name: draft.name.unwrap_or_default(),
            category: draft.category,
            formation: draft.formation,
            founded: draft.founded,
            created_at: Some(Utc::now()),
        }
    }

    fn apply(&mut self, draft: TeamDraft) {
        if let Some(name) = draft.name {
            self.name = name;
        }
        if draft.category.is_some() {
            self.category = draft.category;
        }
        if draft.formation.is_some() {
            self.formation = draft.formation;
        }
        if draft.founded.is_some() {
            self.founded = draft.founded;
        }
    }

    fn rows(data: &DemoDataset) -> &Vec<Self> {
        &data.teams
    }

    fn rows_mut(data: &mut DemoDataset) -> &mut Vec<Self> {
        &mut data.teams
    }
}

// ============================================================================
// Match
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    #[default]
    Scheduled,
    Live,
    Finished,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub profile_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    pub opponent: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub is_home: bool,
    #[serde(default)]
    pub goals_for: Option<i32>,
    #[serde(default)]
    pub goals_against: Option<i32>,
    #[serde(default)]
    pub status: MatchStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opponent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_home: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goals_for: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goals_against: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MatchStatus>,
}

impl MatchDraft {
    pub fn new(opponent: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            opponent: Some(opponent.into()),
            date: Some(date),
            ..Default::default()
        }
    }
}

impl Entity for Match {
    type Draft = MatchDraft;

    const KIND: EntityKind = EntityKind::Match;

    fn id(&self) -> &str {
        &self.id
    }

    fn profile_id(&self) -> &str {
        &self.profile_id
    }

    fn from_draft(id: String, profile_id: String, draft: MatchDraft) -> Self {
        Self {
            id,
            profile_id,
            team_id: draft.team_id,
            opponent: draft.opponent.unwrap_or_default(),
            date: draft.date.unwrap_or_else(|| Utc::now().date_naive()),
            venue: draft.venue,
            is_home: draft.is_home.unwrap_or(true),
            goals_for: draft.goals_for,
            goals_against: draft.goals_against,
            status: draft.status.unwrap_or_default(),
        }
    }

    fn apply(&mut self, draft: MatchDraft) {
        if draft.team_id.is_some() {
            self.team_id = draft.team_id;
        }
        if let Some(opponent) = draft.opponent {
            self.opponent = opponent;
        }
        if let Some(date) = draft.date {
            self.date = date;
        }
        if draft.venue.is_some() {
            self.venue = draft.venue;
        }
        if let Some(is_home) = draft.is_home {
            self.is_home = is_home;
        }
        if draft.goals_for.is_some() {
            self.goals_for = draft.goals_for;
        }
        if draft.goals_against.is_some() {
            self.goals_against = draft.goals_against;
        }
        if let Some(status) = draft.status {
            self.status = status;
        }
    }

    fn rows(data: &DemoDataset) -> &Vec<Self> {
        &data.matches
    }

    fn rows_mut(data: &mut DemoDataset) -> &mut Vec<Self> {
        &mut data.matches
    }
}

// ============================================================================
// Club data
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClubData {
    pub id: String,
    pub profile_id: String,
    pub name: String,
    #[serde(default)]
    pub stadium: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub founded: Option<i32>,
    #[serde(default)]
    pub colors: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClubDataDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stadium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub founded: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colors: Option<String>,
}

impl Entity for ClubData {
    type Draft = ClubDataDraft;

    const KIND: EntityKind = EntityKind::ClubData;

    fn id(&self) -> &str {
        &self.id
    }

    fn profile_id(&self) -> &str {
        &self.profile_id
    }

    fn from_draft(id: String, profile_id: String, draft: ClubDataDraft) -> Self {
        Self {
            id,
            profile_id,
            name: draft.name.unwrap_or_default(),
            stadium: draft.stadium,
            city: draft.city,
            founded: draft.founded,
            colors: draft.colors,
        }
    }

    fn apply(&mut self, draft: ClubDataDraft) {
        if let Some(name) = draft.name {
            self.name = name;
        }
        if draft.stadium.is_some() {
            self.stadium = draft.stadium;
        }
        if draft.city.is_some() {
            self.city = draft.city;
        }
        if draft.founded.is_some() {
            self.founded = draft.founded;
        }
        if draft.colors.is_some() {
            self.colors = draft.colors;
        }
    }

    fn rows(data: &DemoDataset) -> &Vec<Self> {
        &data.club_data
    }

    fn rows_mut(data: &mut DemoDataset) -> &mut Vec<Self> {
        &mut data.club_data
    }
}

// ============================================================================
// Attendance
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    #[default]
    Present,
    Absent,
    Late,
    Excused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub profile_id: String,
    pub player_id: String,
    #[serde(default)]
    pub match_id: Option<String>,
    pub session_date: NaiveDate,
    #[serde(default)]
    pub status: AttendanceStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttendanceDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AttendanceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Entity for AttendanceRecord {
    type Draft = AttendanceDraft;

    const KIND: EntityKind = EntityKind::Attendance;

    fn id(&self) -> &str {
        &self.id
    }

    fn profile_id(&self) -> &str {
        &self.profile_id
    }

    fn from_draft(id: String, profile_id: String, draft: AttendanceDraft) -> Self {
        Self {
            id,
            profile_id,
            player_id: draft.player_id.unwrap_or_default(),
            match_id: draft.match_id,
            session_date: draft
                .session_date
                .unwrap_or_else(|| Utc::now().date_naive()),
            status: draft.status.unwrap_or_default(),
            notes: draft.notes,
        }
    }

    fn apply(&mut self, draft: AttendanceDraft) {
        if let Some(player_id) = draft.player_id {
            self.player_id = player_id;
        }
        if draft.match_id.is_some() {
            self.match_id = draft.match_id;
        }
        if let Some(date) = draft.session_date {
            self.session_date = date;
        }
        if let Some(status) = draft.status {
            self.status = status;
        }
        if draft.notes.is_some() {
            self.notes = draft.notes;
        }
    }

    fn rows(data: &DemoDataset) -> &Vec<Self> {
        &data.attendance
    }

    fn rows_mut(data: &mut DemoDataset) -> &mut Vec<Self> {
        &mut data.attendance
    }
}
