//! Persisted daemon state.
//!
//! The state file records what must survive a restart: the generation
//! counter, which generation was live ("the last-committed marker"), the
//! retained backups, safe mode, and the tamper counter.  On restart the
//! daemon re-applies the recorded live generation from its on-disk artifact,
//! which is what makes a crash between applier stages recoverable.
//!
//! Like every versioned file Zonewall writes, the state file is a tagged
//! [`Spec`] enum: old versions keep parsing forever and are migrated
//! forward in memory.

use std::{fs, io, sync::Arc};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::center::{Center, State};

pub mod generations;
pub mod tokens;
pub mod v1;

//----------- Spec -------------------------------------------------------------

/// The state file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "version")]
pub enum Spec {
    /// The version 1 format.
    V1(v1::Spec),
}

//--- Conversion

impl Spec {
    /// Merge this specification into live state.
    pub fn parse_into(self, state: &mut State) {
        match self {
            Self::V1(spec) => spec.parse_into(state),
        }
    }

    /// Build from live state.
    pub fn build(state: &State) -> Self {
        Self::V1(v1::Spec::build(state))
    }
}

//--- Loading / Saving

impl Spec {
    /// Load and parse this specification from a file.
    pub fn load(path: &Utf8Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Build and save this specification to a file.
    pub fn save(&self, path: &Utf8Path) -> io::Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        crate::util::write_file(path, text.as_bytes())
    }
}

/// Persist the global state immediately.
///
/// Used around commits and during shutdown, when the debounced save must
/// not be waited for.  An in-flight debounced task may still write again
/// later; a redundant save of identical state is harmless.
pub fn save_now(center: &Arc<Center>) {
    let (path, spec);
    {
        let mut state = center.state.lock().unwrap();
        state.save_scheduled = false;
        path = center.config.state_file();
        spec = Spec::build(&state);
    }

    if let Err(err) = spec.save(&path) {
        error!("Could not save global state to '{path}': {err}");
    }
}
