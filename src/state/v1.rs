//! Version 1 of the state file.

use serde::{Deserialize, Serialize};

use zonewall_ruleset::Fingerprint;

use crate::center::{BackupRecord, State};

//----------- Spec -------------------------------------------------------------

/// The state file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Spec {
    /// The next generation id to hand out.
    pub next_generation_id: u64,

    /// The last-committed generation, re-applied on restart.
    pub live: Option<u64>,

    /// The rollback target retained beside it.
    pub prior: Option<u64>,

    /// Why the daemon was in safe mode when it stopped, if it was.
    pub safe_mode: Option<String>,

    /// External mutations restored over this state's lifetime.
    pub tamper_count: u64,

    /// Retained generations.
    pub backup: Vec<BackupSpec>,
}

//--- Conversion

impl Spec {
    /// Merge this specification into live state.
    ///
    /// The live and prior generation artifacts are loaded separately (from
    /// the generations directory); this only restores the bookkeeping.
    pub fn parse_into(self, state: &mut State) {
        state.next_generation_id = self.next_generation_id;
        state.live_id = self.live;
        state.safe_mode = self.safe_mode;
        state.tamper_count = self.tamper_count;
        state.backups = self.backup.into_iter().map(BackupSpec::parse).collect();
    }

    /// Build from live state.
    pub fn build(state: &State) -> Self {
        Self {
            next_generation_id: state.next_generation_id,
            live: state.live_id,
            prior: state.prior.as_ref().map(|generation| generation.id),
            safe_mode: state.safe_mode.clone(),
            tamper_count: state.tamper_count,
            backup: state.backups.iter().map(BackupSpec::build).collect(),
        }
    }
}

//----------- BackupSpec -------------------------------------------------------

/// One retained generation.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BackupSpec {
    pub id: u64,
    pub fingerprint: Fingerprint,
    pub created: jiff::Timestamp,
    pub label: Option<String>,
}

impl BackupSpec {
    fn parse(self) -> BackupRecord {
        BackupRecord {
            id: self.id,
            fingerprint: self.fingerprint,
            created: self.created,
            label: self.label,
        }
    }

    fn build(record: &BackupRecord) -> Self {
        Self {
            id: record.id,
            fingerprint: record.fingerprint,
            created: record.created,
            label: record.label.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_spec_round_trips_through_toml() {
        let spec = crate::state::Spec::V1(Spec {
            next_generation_id: 12,
            live: Some(11),
            prior: Some(10),
            safe_mode: None,
            tamper_count: 2,
            backup: vec![BackupSpec {
                id: 7,
                fingerprint: Fingerprint::of(b"ruleset"),
                created: jiff::Timestamp::UNIX_EPOCH,
                label: Some("before-vlan-change".into()),
            }],
        });

        let text = toml::to_string_pretty(&spec).unwrap();
        assert!(text.contains("version = \"v1\""));

        let back: crate::state::Spec = toml::from_str(&text).unwrap();
        let crate::state::Spec::V1(back) = back;
        assert_eq!(back.next_generation_id, 12);
        assert_eq!(back.backup.len(), 1);
        assert_eq!(back.backup[0].label.as_deref(), Some("before-vlan-change"));
    }
}
