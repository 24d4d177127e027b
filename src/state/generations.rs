//! Persistence of generation artifacts.
//!
//! Each retained generation is a directory under the state dir holding the
//! source document, the compiled ruleset text, and a metadata file carrying
//! the fingerprint.  The live and prior generations are always retained (so
//! restart recovery and rollback work); operator backups are retained until
//! deleted.

use std::{fs, io};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::warn;

use zonewall_ruleset::{CompiledRuleset, Fingerprint};

use crate::center::Generation;
use crate::config::Config;
use crate::util;

/// The metadata file inside a generation directory.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct MetaSpec {
    id: u64,
    fingerprint: Fingerprint,
    table: String,
}

fn dir_for(config: &Config, id: u64) -> Utf8PathBuf {
    config.generations_dir().join(format!("gen-{id}"))
}

/// Persist a generation's artifacts.
pub fn save(config: &Config, generation: &Generation) -> io::Result<()> {
    let dir = dir_for(config, generation.id);
    util::write_file(&dir.join("document.conf"), generation.source.as_bytes())?;
    util::write_file(
        &dir.join("ruleset.nft"),
        generation.compiled.text.as_bytes(),
    )?;

    let meta = MetaSpec {
        id: generation.id,
        fingerprint: generation.compiled.fingerprint,
        table: generation.compiled.table.clone(),
    };
    let text = toml::to_string_pretty(&meta)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    util::write_file(&dir.join("meta.toml"), text.as_bytes())
}

/// Load a retained generation's artifacts.
///
/// The graph is rebuilt from the stored document rather than persisted;
/// compilation is deterministic, so the stored ruleset text and the rebuilt
/// graph stay consistent, and the fingerprint check below catches any drift.
pub fn load(config: &Config, id: u64) -> io::Result<(String, CompiledRuleset)> {
    let dir = dir_for(config, id);
    let source = fs::read_to_string(dir.join("document.conf"))?;
    let text = fs::read_to_string(dir.join("ruleset.nft"))?;

    let meta: MetaSpec = toml::from_str(&fs::read_to_string(dir.join("meta.toml"))?)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

    let fingerprint = Fingerprint::of(text.as_bytes());
    if fingerprint != meta.fingerprint {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("generation {id} artifact does not match its fingerprint"),
        ));
    }

    // The manifests are rebuilt by the applier when it reparses the source;
    // the stored artifact only needs text and fingerprint for re-application.
    Ok((
        source,
        CompiledRuleset {
            table: meta.table,
            text,
            sets: Vec::new(),
            fingerprint,
        },
    ))
}

/// Delete generation directories that are neither live, prior, nor backed up.
pub fn prune(config: &Config, keep: &[u64]) {
    let dir = config.generations_dir();
    let entries = match fs::read_dir(dir.as_std_path()) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return,
        Err(err) => {
            warn!("Could not prune old generations: {err}");
            return;
        }
    };

    for entry in entries.flatten() {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let Some(id) = name.strip_prefix("gen-").and_then(|s| s.parse::<u64>().ok()) else {
            continue;
        };
        if keep.contains(&id) {
            continue;
        }
        if let Err(err) = fs::remove_dir_all(entry.path()) {
            warn!("Could not remove retained generation {id}: {err}");
        }
    }
}

/// List the ids present on disk, unordered.
pub fn list(config: &Config) -> Vec<u64> {
    let dir = config.generations_dir();
    let Ok(entries) = fs::read_dir(dir.as_std_path()) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            entry
                .file_name()
                .into_string()
                .ok()?
                .strip_prefix("gen-")?
                .parse()
                .ok()
        })
        .collect()
}

/// Whether a generation's artifacts exist on disk.
pub fn exists(config: &Config, id: u64) -> bool {
    dir_for(config, id).join("meta.toml").exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use zonewall_ruleset::{compile, Capabilities, Graph};

    fn test_config(dir: &Utf8Path) -> Config {
        let cmd = crate::config::Config::setup_cli(clap::Command::new("test"));
        let matches = cmd.get_matches_from(["test"]);
        let mut config = Config::init(&matches).unwrap();
        config.state_dir = dir.to_owned();
        config
    }

    fn generation(id: u64) -> Generation {
        let graph = Graph::default();
        let compiled = compile(&graph, &Capabilities::FULL).unwrap();
        Generation {
            id,
            source: "schema_version = 2\n".into(),
            graph: Arc::new(graph),
            compiled,
        }
    }

    #[test]
    fn save_load_round_trip_checks_the_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(Utf8Path::from_path(dir.path()).unwrap());

        let generation = generation(4);
        save(&config, &generation).unwrap();

        let (source, compiled) = load(&config, 4).unwrap();
        assert_eq!(source, generation.source);
        assert_eq!(compiled.fingerprint, generation.compiled.fingerprint);

        // Corrupt the artifact; loading must refuse.
        let path = dir_for(&config, 4).join("ruleset.nft");
        fs::write(&path, "tampered").unwrap();
        assert!(load(&config, 4).is_err());
    }

    #[test]
    fn prune_keeps_only_the_requested_ids() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(Utf8Path::from_path(dir.path()).unwrap());

        for id in [1, 2, 3] {
            save(&config, &generation(id)).unwrap();
        }
        prune(&config, &[2]);

        let mut remaining = list(&config);
        remaining.sort();
        assert_eq!(remaining, vec![2]);
    }
}
