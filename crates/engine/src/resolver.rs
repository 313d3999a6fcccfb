//! Precedence resolution: identifiers in, scope chain out.

use spendgate_config::{AppConfig, KeyPolicy, TeamPolicy};
use spendgate_core::error::AdmissionError;
use spendgate_core::{BudgetMode, ScopeChain, ScopeKind, ScopeSpec};
use std::collections::HashMap;

/// Maps a request's (team, key) identifiers onto the chain of scopes
/// that must all authorize it.
///
/// The chain is ordered most-specific first — key scope, then team
/// scope — which is also the fixed lock order used everywhere else.
/// The effective mode is the most restrictive mode configured anywhere
/// in the chain: a tight team-level budget must constrain a request
/// even when its key has ample allowance of its own.
pub struct PrecedenceResolver {
    teams: HashMap<String, TeamPolicy>,
    keys: HashMap<String, KeyPolicy>,
}

impl PrecedenceResolver {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            teams: config
                .teams
                .iter()
                .map(|t| (t.id.clone(), t.clone()))
                .collect(),
            keys: config
                .keys
                .iter()
                .map(|k| (k.id.clone(), k.clone()))
                .collect(),
        }
    }

    /// Resolve the scope chain for a request.
    ///
    /// Fails when either identifier is unknown or when the key is not
    /// owned by the named team — both are configuration faults surfaced
    /// to the caller, never silently admitted.
    pub fn resolve(&self, team_id: &str, key_id: &str) -> Result<ScopeChain, AdmissionError> {
        let key = self.keys.get(key_id).ok_or_else(|| {
            AdmissionError::ScopeResolution(format!("unknown key: {key_id:?}"))
        })?;
        let team = self.teams.get(team_id).ok_or_else(|| {
            AdmissionError::ScopeResolution(format!("unknown team: {team_id:?}"))
        })?;
        if key.team != team.id {
            return Err(AdmissionError::ScopeResolution(format!(
                "key {key_id:?} is owned by team {:?}, not {team_id:?}",
                key.team
            )));
        }

        Ok(ScopeChain {
            team_id: team.id.clone(),
            key_id: key.id.clone(),
            scopes: vec![
                ScopeSpec {
                    kind: ScopeKind::Key,
                    id: key.id.clone(),
                    limit_usd: key.limit_usd,
                    overdraft_usd: key.overdraft_usd,
                },
                ScopeSpec {
                    kind: ScopeKind::Team,
                    id: team.id.clone(),
                    limit_usd: team.limit_usd,
                    overdraft_usd: team.overdraft_usd,
                },
            ],
            mode: key.mode.max(team.mode),
        })
    }

    /// The team that owns a key, when the caller only knows the key.
    pub fn owning_team(&self, key_id: &str) -> Option<&str> {
        self.keys.get(key_id).map(|k| k.team.as_str())
    }
}
