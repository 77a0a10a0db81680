//! Subcommand implementations.

use std::sync::Arc;
use std::time::Duration;

use miette::{Result, miette};
use serde::Serialize;
use statsor_sync::{
    ClubDataDraft, DataAccess, EntityKind, FileStore, ListFilter, MatchDraft, PersistedStore,
    Player, PlayerDraft, SessionContext, SyncConfig, SyncError, TeamDraft, WebSocketTransport,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::{Cli, ClubCommand, MatchCommand, PlayerCommand, TeamCommand};

fn to_report(e: SyncError) -> miette::Report {
    miette!("{}", e)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| miette!("{}", e))?;
    println!("{}", json);
    Ok(())
}

pub struct Context {
    session: Arc<SessionContext>,
    access: Arc<DataAccess>,
}

impl Context {
    /// Restore the persisted session and build the data facade over it.
    pub fn open(cli: &Cli) -> Result<Self> {
        let data_dir = match &cli.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .map(|dir| dir.join("statsor"))
                .ok_or_else(|| miette!("no data directory available, pass --data-dir"))?,
        };
        let store = PersistedStore::new(Arc::new(FileStore::open(&data_dir).map_err(to_report)?));
        let session = SessionContext::restore(store);

        let config = SyncConfig::builder()
            .api_url(cli.api_url.clone())
            .changefeed_url(cli.changefeed_url.clone())
            .cache_ttl(Duration::from_secs(cli.ttl_secs))
            .fetch_timeout(Duration::from_millis(cli.timeout_ms))
            .build()
            .map_err(to_report)?;

        let transport = WebSocketTransport::new(cli.changefeed_url.clone())
            .with_session(Arc::clone(&session));

        let access = DataAccess::builder(config, Arc::clone(&session))
            .transport(Arc::new(transport))
            .build()
            .map_err(to_report)?;

        Ok(Self { session, access })
    }

    pub async fn login(&self, account: &str, token: &str) -> Result<()> {
        self.session.login(account, token).await.map_err(to_report)?;
        self.status().await
    }

    pub async fn demo(&self) -> Result<()> {
        self.session.activate_demo().await.map_err(to_report)?;
        self.status().await
    }

    pub async fn logout(&self) -> Result<()> {
        self.session.logout().await.map_err(to_report)?;
        self.status().await
    }

    pub async fn status(&self) -> Result<()> {
        let state = self.session.current().await;
        print_json(&serde_json::json!({
            "signed_in": state.account().is_some(),
            "mode": state.mode(),
            "account": state.account(),
        }))
    }

    pub async fn players(&self, action: PlayerCommand) -> Result<()> {
        match action {
            PlayerCommand::List { filter } => {
                let resolved = self.access.list_resolved::<Player>(filter.as_ref()).await;
                info!(origin = ?resolved.origin, count = resolved.value.len(), "players");
                print_json(&resolved.value)
            }
            PlayerCommand::Get { id } => match self.access.get_player(&id).await {
                Some(player) => print_json(&player),
                None => Err(miette!("player {} not found", id)),
            },
            PlayerCommand::Add {
                name,
                position,
                fields,
            } => {
                let draft = PlayerDraft {
                    team_id: fields.team_id,
                    jersey_number: fields.jersey_number,
                    age: fields.age,
                    email: fields.email,
                    nationality: fields.nationality,
                    ..PlayerDraft::new(name, position)
                };
                let player = self.access.add_player(draft).await.map_err(to_report)?;
                print_json(&player)
            }
            PlayerCommand::Update {
                id,
                name,
                position,
                fields,
            } => {
                let draft = PlayerDraft {
                    name,
                    position,
                    team_id: fields.team_id,
                    jersey_number: fields.jersey_number,
                    age: fields.age,
                    email: fields.email,
                    nationality: fields.nationality,
                    ..Default::default()
                };
                let player = self
                    .access
                    .update_player(&id, draft)
                    .await
                    .map_err(to_report)?;
                print_json(&player)
            }
            PlayerCommand::Delete { id } => {
                self.access.delete_player(&id).await.map_err(to_report)?;
                info!(id, "player deleted");
                Ok(())
            }
        }
    }

    pub async fn teams(&self, action: TeamCommand) -> Result<()> {
        match action {
            TeamCommand::List => print_json(&self.access.get_teams().await),
            TeamCommand::Add {
                name,
                category,
                formation,
                founded,
            } => {
                let draft = TeamDraft {
                    category,
                    formation,
                    founded,
                    ..TeamDraft::new(name)
                };
                let team = self.access.add_team(draft).await.map_err(to_report)?;
                print_json(&team)
            }
            TeamCommand::Delete { id } => {
                self.access.delete_team(&id).await.map_err(to_report)?;
                info!(id, "team deleted");
                Ok(())
            }
        }
    }

    pub async fn matches(&self, action: MatchCommand) -> Result<()> {
        match action {
            MatchCommand::List { filter } => {
                print_json(&self.access.get_matches(filter.as_ref()).await)
            }
            MatchCommand::Add {
                opponent,
                date,
                team_id,
                venue,
                home,
            } => {
                let draft = MatchDraft {
                    team_id,
                    venue,
                    is_home: Some(home),
                    ..MatchDraft::new(opponent, date)
                };
                let created = self.access.add_match(draft).await.map_err(to_report)?;
                print_json(&created)
            }
            MatchCommand::Delete { id } => {
                self.access.delete_match(&id).await.map_err(to_report)?;
                info!(id, "match deleted");
                Ok(())
            }
        }
    }

    pub async fn attendance(&self, filter: Option<ListFilter>) -> Result<()> {
        print_json(&self.access.get_attendance(filter.as_ref()).await)
    }

    pub async fn club(&self, action: ClubCommand) -> Result<()> {
        match action {
            ClubCommand::Show => match self.access.get_club_data().await {
                Some(club) => print_json(&club),
                None => Err(miette!("no club profile for this account")),
            },
            ClubCommand::Update {
                id,
                name,
                stadium,
                city,
                founded,
                colors,
            } => {
                let draft = ClubDataDraft {
                    name,
                    stadium,
                    city,
                    founded,
                    colors,
                };
                let club = self
                    .access
                    .update_club_data(&id, draft)
                    .await
                    .map_err(to_report)?;
                print_json(&club)
            }
        }
    }

    /// Stream data events for one table until interrupted or `for_secs`
    /// elapses.
    pub async fn watch(
        &self,
        table: &str,
        filter: Option<ListFilter>,
        for_secs: Option<u64>,
    ) -> Result<()> {
        let kind = EntityKind::from_table(table).ok_or_else(|| {
            miette!(
                "unknown table '{}', expected one of: players, teams, matches, club_data, attendance",
                table
            )
        })?;

        let mut events = self.access.subscribe();
        let Some(_subscription) = self.access.watch(kind, filter).await else {
            return Err(miette!("live updates need a signed-in, non-demo session"));
        };
        info!(%kind, "watching for changes");

        let deadline = async {
            match for_secs {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        let line = serde_json::to_string(&event).map_err(|e| miette!("{}", e))?;
                        println!("{}", line);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "fell behind, some notifications were dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use statsor_sync::SessionState;

    fn cli(dir: &std::path::Path, args: &[&str]) -> Cli {
        let mut argv = vec!["statsor", "--data-dir", dir.to_str().unwrap()];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[tokio::test]
    async fn test_demo_session_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        let ctx = Context::open(&cli(dir.path(), &["demo"])).unwrap();
        ctx.demo().await.unwrap();

        let reopened = Context::open(&cli(dir.path(), &["status"])).unwrap();
        assert!(matches!(
            reopened.session.current().await,
            SessionState::Demo { .. }
        ));
        assert_eq!(reopened.access.get_players(None).await.len(), 5);

        reopened.logout().await.unwrap();
        let after = Context::open(&cli(dir.path(), &["status"])).unwrap();
        assert_eq!(after.session.current().await, SessionState::SignedOut);
    }
}
