//! Maintenance mode state machine: `off -> entering -> quiesced ->
//! exiting -> off`. Entering maintenance lets an operator run exclusive
//! ops modes (snapshot, gc-rewrite-run) without racing live writers;
//! `quiesced` is the only state those modes may assume is stable.

use crate::error::{Result, SeglakeError};
use crate::metadata::MetadataStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaintenanceState {
    Off,
    Entering,
    Quiesced,
    Exiting,
}

impl MaintenanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceState::Off => "off",
            MaintenanceState::Entering => "entering",
            MaintenanceState::Quiesced => "quiesced",
            MaintenanceState::Exiting => "exiting",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "off" => MaintenanceState::Off,
            "entering" => MaintenanceState::Entering,
            "quiesced" => MaintenanceState::Quiesced,
            "exiting" => MaintenanceState::Exiting,
            other => return Err(SeglakeError::invalid_argument(format!("unknown maintenance state: {other}"))),
        })
    }

    fn next_on_enter(&self) -> Result<Self> {
        match self {
            MaintenanceState::Off => Ok(MaintenanceState::Entering),
            other => Err(SeglakeError::concurrency(format!("cannot enter maintenance from {}", other.as_str()))),
        }
    }

    fn next_on_quiesce(&self) -> Result<Self> {
        match self {
            MaintenanceState::Entering => Ok(MaintenanceState::Quiesced),
            other => Err(SeglakeError::concurrency(format!("cannot quiesce from {}", other.as_str()))),
        }
    }

    fn next_on_exit(&self) -> Result<Self> {
        match self {
            MaintenanceState::Quiesced => Ok(MaintenanceState::Exiting),
            other => Err(SeglakeError::concurrency(format!("cannot exit maintenance from {}", other.as_str()))),
        }
    }

    fn next_on_off(&self) -> Result<Self> {
        match self {
            MaintenanceState::Exiting => Ok(MaintenanceState::Off),
            other => Err(SeglakeError::concurrency(format!("cannot complete exit from {}", other.as_str()))),
        }
    }
}

/// Drives the state machine against the metadata store's single
/// `maintenance_state` row, rejecting any transition skipping a step.
pub struct MaintenanceController<'a> {
    meta: &'a MetadataStore,
}

impl<'a> MaintenanceController<'a> {
    pub fn new(meta: &'a MetadataStore) -> Self {
        Self { meta }
    }

    pub async fn current(&self) -> Result<MaintenanceState> {
        MaintenanceState::parse(&self.meta.maintenance_state().await?)
    }

    async fn transition(&self, step: impl Fn(&MaintenanceState) -> Result<MaintenanceState>) -> Result<MaintenanceState> {
        let current = self.current().await?;
        let next = step(&current)?;
        self.meta.set_maintenance_state(next.as_str()).await?;
        Ok(next)
    }

    pub async fn enter(&self) -> Result<MaintenanceState> {
        self.transition(MaintenanceState::next_on_enter).await
    }

    pub async fn mark_quiesced(&self) -> Result<MaintenanceState> {
        self.transition(MaintenanceState::next_on_quiesce).await
    }

    pub async fn begin_exit(&self) -> Result<MaintenanceState> {
        self.transition(MaintenanceState::next_on_exit).await
    }

    pub async fn complete_exit(&self) -> Result<MaintenanceState> {
        self.transition(MaintenanceState::next_on_off).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("meta.db"), "site".to_string(), 1).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn full_cycle_returns_to_off() {
        let (_dir, meta) = store().await;
        let ctl = MaintenanceController::new(&meta);
        assert_eq!(ctl.current().await.unwrap(), MaintenanceState::Off);
        assert_eq!(ctl.enter().await.unwrap(), MaintenanceState::Entering);
        assert_eq!(ctl.mark_quiesced().await.unwrap(), MaintenanceState::Quiesced);
        assert_eq!(ctl.begin_exit().await.unwrap(), MaintenanceState::Exiting);
        assert_eq!(ctl.complete_exit().await.unwrap(), MaintenanceState::Off);
    }

    #[tokio::test]
    async fn skipping_a_step_is_rejected() {
        let (_dir, meta) = store().await;
        let ctl = MaintenanceController::new(&meta);
        assert!(ctl.mark_quiesced().await.is_err());
        ctl.enter().await.unwrap();
        assert!(ctl.begin_exit().await.is_err());
    }

    #[test]
    fn parse_rejects_unknown_state() {
        assert!(MaintenanceState::parse("paused").is_err());
    }
}
