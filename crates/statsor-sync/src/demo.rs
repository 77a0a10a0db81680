//! The local demo dataset and the data source that serves it.
//!
//! Demo data lives entirely in the persisted store under
//! `demo_account_data`; nothing here touches the network.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::{
    AttendanceRecord, AttendanceStatus, ClubData, Entity, ListFilter, Match, MatchStatus, Player,
    PlayerDraft, Team,
};
use crate::source::{DataSource, Scope};
use crate::storage::PersistedStore;

/// Every table for the demo account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DemoDataset {
    #[serde(default)]
    pub players: Vec<Player>,
    #[serde(default)]
    pub teams: Vec<Team>,
    #[serde(default)]
    pub matches: Vec<Match>,
    #[serde(default)]
    pub club_data: Vec<ClubData>,
    #[serde(default)]
    pub attendance: Vec<AttendanceRecord>,
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

impl DemoDataset {
    /// A small club with one squad, a few fixtures and some attendance.
    pub fn seeded(account: &str) -> Self {
        let account = account.to_string();
        let team_id = "demo-team-1".to_string();

        let roster = [
            ("demo-player-1", "Marc Ter Stegen", "GK", 1, 32, 0, 0),
            ("demo-player-2", "Ronald Araujo", "CB", 4, 25, 2, 0),
            ("demo-player-3", "Pedri Gonzalez", "CM", 8, 21, 4, 7),
            ("demo-player-4", "Lamine Yamal", "RW", 19, 17, 6, 9),
            ("demo-player-5", "Robert Lewandowski", "ST", 9, 35, 19, 3),
        ];
        let players = roster
            .into_iter()
            .map(|(id, name, position, jersey, age, goals, assists)| {
                let mut player = Player::from_draft(
                    id.to_string(),
                    account.clone(),
                    PlayerDraft {
                        team_id: Some(team_id.clone()),
                        jersey_number: Some(jersey),
                        age: Some(age),
                        goals: Some(goals),
                        assists: Some(assists),
                        matches_played: Some(12),
                        ..PlayerDraft::new(name, position)
                    },
                );
                player.nationality = Some("ES".to_string());
                player
            })
            .collect();

        let teams = vec![Team {
            id: team_id.clone(),
            profile_id: account.clone(),
            name: "First Team".to_string(),
            category: Some("senior".to_string()),
            formation: Some("4-3-3".to_string()),
            founded: Some(1899),
            created_at: None,
        }];

        let matches = vec![
            Match {
                id: "demo-match-1".to_string(),
                profile_id: account.clone(),
                team_id: Some(team_id.clone()),
                opponent: "Athletic Club".to_string(),
                date: date(2025, 3, 1),
                venue: Some("Home Ground".to_string()),
                is_home: true,
                goals_for: Some(3),
                goals_against: Some(1),
                status: MatchStatus::Finished,
            },
            Match {
                id: "demo-match-2".to_string(),
                profile_id: account.clone(),
                team_id: Some(team_id.clone()),
                opponent: "Valencia CF".to_string(),
                date: date(2025, 3, 9),
                venue: None,
                is_home: false,
                goals_for: None,
                goals_against: None,
                status: MatchStatus::Scheduled,
            },
        ];

        let club_data = vec![ClubData {
            id: "demo-club".to_string(),
            profile_id: account.clone(),
            name: "Demo FC".to_string(),
            stadium: Some("Home Ground".to_string()),
            city: Some("Barcelona".to_string()),
            founded: Some(1899),
            colors: Some("blue and claret".to_string()),
        }];

        let attendance = vec![
            AttendanceRecord {
                id: "demo-att-1".to_string(),
                profile_id: account.clone(),
                player_id: "demo-player-3".to_string(),
                match_id: Some("demo-match-1".to_string()),
                session_date: date(2025, 3, 1),
                status: AttendanceStatus::Present,
                notes: None,
            },
            AttendanceRecord {
                id: "demo-att-2".to_string(),
                profile_id: account,
                player_id: "demo-player-4".to_string(),
                match_id: None,
                session_date: date(2025, 3, 4),
                status: AttendanceStatus::Late,
                notes: Some("traffic".to_string()),
            },
        ];

        Self {
            players,
            teams,
            matches,
            club_data,
            attendance,
        }
    }
}

/// Serves the demo dataset from the persisted store.
#[derive(Debug, Clone)]
pub struct DemoDataSource {
    store: Arc<PersistedStore>,
}

impl DemoDataSource {
    pub fn new(store: Arc<PersistedStore>) -> Self {
        Self { store }
    }

    /// Rows for `scope`, read synchronously. Storage errors degrade to an
    /// empty list.
    pub fn list_rows<E: Entity>(&self, scope: &Scope, filter: Option<&ListFilter>) -> Vec<E> {
        match self.store.demo_data_or_seed(&scope.account) {
            Ok(data) => E::rows(&data)
                .iter()
                .filter(|row| row.profile_id() == scope.account)
                .filter(|row| filter.is_none_or(|f| f.matches(*row)))
                .cloned()
                .collect(),
            Err(e) => {
                warn!(kind = %E::KIND, error = %e, "demo dataset unavailable");
                Vec::new()
            }
        }
    }

    pub fn find_row<E: Entity>(&self, scope: &Scope, id: &str) -> Option<E> {
        self.list_rows::<E>(scope, None)
            .into_iter()
            .find(|row| row.id() == id)
    }
}

#[async_trait]
impl DataSource for DemoDataSource {
    async fn list<E: Entity>(
        &self,
        scope: &Scope,
        filter: Option<&ListFilter>,
    ) -> Result<Vec<E>, SyncError> {
        Ok(self.list_rows(scope, filter))
    }

    async fn get<E: Entity>(&self, scope: &Scope, id: &str) -> Result<Option<E>, SyncError> {
        Ok(self.find_row(scope, id))
    }

    async fn add<E: Entity>(&self, scope: &Scope, draft: E::Draft) -> Result<E, SyncError> {
        let row = E::from_draft(Uuid::new_v4().to_string(), scope.account.clone(), draft);
        let created = row.clone();
        self.store
            .update_demo_data(&scope.account, move |data| E::rows_mut(data).push(row))?;
        debug!(kind = %E::KIND, id = created.id(), "demo row added");
        Ok(created)
    }

    async fn update<E: Entity>(
        &self,
        scope: &Scope,
        id: &str,
        draft: E::Draft,
    ) -> Result<E, SyncError> {
        let account = scope.account.clone();
        let updated = self.store.update_demo_data(&scope.account, |data| {
            E::rows_mut(data)
                .iter_mut()
                .find(|row| row.id() == id && row.profile_id() == account)
                .map(|row| {
                    row.apply(draft);
                    row.clone()
                })
        })?;
        updated.ok_or_else(|| SyncError::NotFound {
            kind: E::KIND,
            id: id.to_string(),
        })
    }

    async fn delete<E: Entity>(&self, scope: &Scope, id: &str) -> Result<bool, SyncError> {
        let account = scope.account.clone();
        let removed = self.store.update_demo_data(&scope.account, |data| {
            let rows = E::rows_mut(data);
            let before = rows.len();
            rows.retain(|row| !(row.id() == id && row.profile_id() == account));
            before != rows.len()
        })?;
        debug!(kind = %E::KIND, id, removed, "demo row delete");
        Ok(removed)
    }
}
