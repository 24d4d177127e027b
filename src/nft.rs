//! The kernel ruleset backend.
//!
//! The compiler produces a pure text value; this module is the writer that
//! turns it into kernel state.  The split is deliberate: nothing in the
//! compiler may touch the kernel, and nothing here may make policy
//! decisions.
//!
//! The production backend drives `nft(8)` with programs on stdin.  A whole
//! program is one kernel transaction, which is what makes the replace
//! program below an atomic swap: the kernel applies all of it or none of
//! it.

use std::fmt;
use std::process::Stdio;

use camino::Utf8PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use zonewall_api::msg::CounterReading;
use zonewall_ruleset::{Capabilities, CompiledRuleset};

/// The table everything below operates on.
const TABLE: &str = zonewall_ruleset::compile::TABLE_NAME;

//----------- BackendError -----------------------------------------------------

/// A kernel interface failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendError {
    /// What the kernel (or nft) said.
    pub message: String,
}

impl std::error::Error for BackendError {}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

//----------- RulesetBackend ---------------------------------------------------

/// What the applier and monitors need from the kernel classifier.
///
/// Implementations must not interpret the programs they are handed.
pub trait RulesetBackend: Send + Sync + 'static {
    /// Validate a program without touching the kernel.
    fn check(&self, program: &str) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Run a program as one kernel transaction.
    fn load(&self, program: &str) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// The current listing of our table.
    ///
    /// With `stateless`, counter values and other runtime state are
    /// omitted, so two listings compare equal unless rules or sets
    /// changed.
    fn list_table(
        &self,
        stateless: bool,
    ) -> impl Future<Output = Result<String, BackendError>> + Send;

    /// Remove our table entirely.
    fn delete_table(&self) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Read the named counters.
    fn read_counters(
        &self,
    ) -> impl Future<Output = Result<Vec<CounterReading>, BackendError>> + Send;

    /// The elements of a set.
    fn set_elements(
        &self,
        set: &str,
    ) -> impl Future<Output = Result<Vec<String>, BackendError>> + Send;

    /// Add elements to a set.
    fn add_set_elements(
        &self,
        set: &str,
        elements: &[String],
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Replace a set's contents wholesale, in one kernel transaction.
    ///
    /// The flush and the refill land together or not at all; readers never
    /// observe a half-replaced set.  This is how staged feed contents are
    /// installed.
    fn replace_set_elements(
        &self,
        set: &str,
        elements: &[String],
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Remove one element from a set.
    fn remove_set_element(
        &self,
        set: &str,
        element: &str,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Drop all elements of a set.
    fn flush_set(&self, set: &str) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// What this kernel supports.
    fn probe(&self) -> impl Future<Output = Capabilities> + Send;
}

/// The program that atomically replaces the live table with `compiled`.
///
/// The leading bare declaration makes the delete valid when the table does
/// not exist yet; the whole program is one transaction.
pub fn replace_program(compiled: &CompiledRuleset) -> String {
    format!(
        "table inet {table}\ndelete table inet {table}\n{text}",
        table = compiled.table,
        text = compiled.text
    )
}

//----------- NftCli -----------------------------------------------------------

/// The production backend: `nft(8)` driven over stdin.
#[derive(Clone, Debug)]
pub struct NftCli {
    /// The nft binary.
    path: Utf8PathBuf,
}

impl NftCli {
    pub fn new() -> Self {
        Self {
            path: Utf8PathBuf::from("nft"),
        }
    }

    /// Run nft with a program on stdin.
    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String, BackendError> {
        let mut command = Command::new(self.path.as_std_path());
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| BackendError {
            message: format!("could not run {}: {err}", self.path),
        })?;

        if let Some(program) = stdin {
            let mut handle = child.stdin.take().expect("stdin was piped");
            handle
                .write_all(program.as_bytes())
                .await
                .map_err(|err| BackendError {
                    message: format!("could not feed nft: {err}"),
                })?;
            drop(handle);
        }

        let output = child.wait_with_output().await.map_err(|err| BackendError {
            message: format!("nft did not finish: {err}"),
        })?;

        if !output.status.success() {
            return Err(BackendError {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for NftCli {
    fn default() -> Self {
        Self::new()
    }
}

impl RulesetBackend for NftCli {
    async fn check(&self, program: &str) -> Result<(), BackendError> {
        self.run(&["-c", "-f", "-"], Some(program)).await.map(|_| ())
    }

    async fn load(&self, program: &str) -> Result<(), BackendError> {
        debug!("Loading {} bytes into the kernel classifier", program.len());
        self.run(&["-f", "-"], Some(program)).await.map(|_| ())
    }

    async fn list_table(&self, stateless: bool) -> Result<String, BackendError> {
        let args: &[&str] = if stateless {
            &["-s", "list", "table", "inet", TABLE]
        } else {
            &["list", "table", "inet", TABLE]
        };
        self.run(args, None).await
    }

    async fn delete_table(&self) -> Result<(), BackendError> {
        self.run(&["delete", "table", "inet", TABLE], None)
            .await
            .map(|_| ())
    }

    async fn read_counters(&self) -> Result<Vec<CounterReading>, BackendError> {
        let listing = self.run(&["list", "counters", "table", "inet", TABLE], None).await?;
        Ok(parse_counters(&listing))
    }

    async fn set_elements(&self, set: &str) -> Result<Vec<String>, BackendError> {
        let listing = self.run(&["list", "set", "inet", TABLE, set], None).await?;
        Ok(parse_set_elements(&listing))
    }

    async fn add_set_elements(&self, set: &str, elements: &[String]) -> Result<(), BackendError> {
        if elements.is_empty() {
            return Ok(());
        }
        let program = format!(
            "add element inet {TABLE} {set} {{ {} }}\n",
            elements.join(", ")
        );
        self.run(&["-f", "-"], Some(&program)).await.map(|_| ())
    }

    async fn replace_set_elements(
        &self,
        set: &str,
        elements: &[String],
    ) -> Result<(), BackendError> {
        let mut program = format!("flush set inet {TABLE} {set}\n");
        if !elements.is_empty() {
            program.push_str(&format!(
                "add element inet {TABLE} {set} {{ {} }}\n",
                elements.join(", ")
            ));
        }
        self.run(&["-f", "-"], Some(&program)).await.map(|_| ())
    }

    async fn remove_set_element(&self, set: &str, element: &str) -> Result<(), BackendError> {
        let program = format!("delete element inet {TABLE} {set} {{ {element} }}\n");
        self.run(&["-f", "-"], Some(&program)).await.map(|_| ())
    }

    async fn flush_set(&self, set: &str) -> Result<(), BackendError> {
        self.run(&["flush", "set", "inet", TABLE, set], None)
            .await
            .map(|_| ())
    }

    async fn probe(&self) -> Capabilities {
        // Check-mode programs never touch the kernel, but nft still rejects
        // syntax the kernel (or the nft build) cannot express.
        let probe = |body: &'static str| {
            let program =
                format!("table inet zw_probe {{\n{body}\n}}\ndelete table inet zw_probe\n");
            async move { self.check(&program).await.is_ok() }
        };

        Capabilities {
            time_windows: probe("chain c { meta hour \"09:00\"-\"17:00\" accept }").await,
            rate_limit: probe("chain c { limit rate 10/minute accept }").await,
            named_counters: probe("counter probe { }").await,
        }
    }
}

//--- Listing parsers

/// Extract named counter readings from an `nft list counters` listing.
fn parse_counters(listing: &str) -> Vec<CounterReading> {
    let mut out = Vec::new();
    let mut current: Option<String> = None;

    for line in listing.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("counter ") {
            current = rest.split_whitespace().next().map(str::to_owned);
        } else if let Some(name) = &current {
            if let Some(rest) = line.strip_prefix("packets ") {
                let mut fields = rest.split_whitespace();
                let packets = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                let bytes = fields
                    .nth(1)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                out.push(CounterReading {
                    name: name.clone(),
                    packets,
                    bytes,
                });
                current = None;
            }
        }
    }
    out
}

/// Extract the elements of an `nft list set` listing.
fn parse_set_elements(listing: &str) -> Vec<String> {
    let Some(start) = listing.find("elements = {") else {
        return Vec::new();
    };
    let rest = &listing[start + "elements = {".len()..];
    let Some(end) = rest.find('}') else {
        return Vec::new();
    };
    rest[..end]
        .split(',')
        .map(|elem| elem.trim().to_string())
        .filter(|elem| !elem.is_empty())
        .collect()
}

//----------- MockBackend ------------------------------------------------------

/// An in-memory backend for applier, integrity and set-manager tests.
#[cfg(test)]
pub mod mock {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct MockState {
        /// The currently "loaded" table text, if any.
        pub table: Option<String>,

        /// Every program passed to `load`, in order.
        pub loaded: Vec<String>,

        /// Fail the next `load` call with this message.
        pub fail_next_load: Option<String>,

        /// Set contents.
        pub sets: BTreeMap<String, BTreeSet<String>>,

        /// Every set mutation, in order, for asserting which path ran.
        pub set_ops: Vec<String>,
    }

    #[derive(Debug, Default)]
    pub struct MockBackend {
        pub state: Mutex<MockState>,
        pub caps: Capabilities,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// The table text as the kernel would hold it.
        pub fn table(&self) -> Option<String> {
            self.state.lock().unwrap().table.clone()
        }

        /// Overwrite the kernel table behind the daemon's back.
        pub fn tamper(&self, text: &str) {
            self.state.lock().unwrap().table = Some(text.to_string());
        }

        fn apply_program(state: &mut MockState, program: &str) {
            // The replace program is "declare, delete, redefine"; anything
            // else the mock treats as a whole-table definition.
            let table_start = program
                .match_indices("table inet")
                .map(|(i, _)| i)
                .find(|&i| program[i..].lines().next().is_some_and(|l| l.contains('{')));
            if let Some(start) = table_start {
                state.table = Some(program[start..].to_string());
            }
        }
    }

    impl RulesetBackend for MockBackend {
        async fn check(&self, _program: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn load(&self, program: &str) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            if let Some(message) = state.fail_next_load.take() {
                return Err(BackendError { message });
            }
            state.loaded.push(program.to_string());
            Self::apply_program(&mut state, program);
            Ok(())
        }

        async fn list_table(&self, _stateless: bool) -> Result<String, BackendError> {
            self.state
                .lock()
                .unwrap()
                .table
                .clone()
                .ok_or_else(|| BackendError {
                    message: "No such file or directory".into(),
                })
        }

        async fn delete_table(&self) -> Result<(), BackendError> {
            self.state.lock().unwrap().table = None;
            Ok(())
        }

        async fn read_counters(&self) -> Result<Vec<CounterReading>, BackendError> {
            Ok(Vec::new())
        }

        async fn set_elements(&self, set: &str) -> Result<Vec<String>, BackendError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .sets
                .get(set)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default())
        }

        async fn add_set_elements(
            &self,
            set: &str,
            elements: &[String],
        ) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            state.set_ops.push(format!("add {set} ({})", elements.len()));
            let entry = state.sets.entry(set.to_string()).or_default();
            entry.extend(elements.iter().cloned());
            Ok(())
        }

        async fn replace_set_elements(
            &self,
            set: &str,
            elements: &[String],
        ) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            state
                .set_ops
                .push(format!("replace {set} ({})", elements.len()));
            state
                .sets
                .insert(set.to_string(), elements.iter().cloned().collect());
            Ok(())
        }

        async fn remove_set_element(&self, set: &str, element: &str) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            state.set_ops.push(format!("remove {set} {element}"));
            if let Some(entry) = state.sets.get_mut(set) {
                entry.remove(element);
            }
            Ok(())
        }

        async fn flush_set(&self, set: &str) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            state.set_ops.push(format!("flush {set}"));
            if let Some(entry) = state.sets.get_mut(set) {
                entry.clear();
            }
            Ok(())
        }

        async fn probe(&self) -> Capabilities {
            self.caps
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_program_is_declare_delete_redefine() {
        let compiled = zonewall_ruleset::compile(
            &zonewall_ruleset::Graph::default(),
            &Capabilities::FULL,
        )
        .unwrap();
        let program = replace_program(&compiled);

        let mut lines = program.lines();
        assert_eq!(lines.next(), Some("table inet zonewall"));
        assert_eq!(lines.next(), Some("delete table inet zonewall"));
        assert_eq!(lines.next(), Some("table inet zonewall {"));
    }

    #[test]
    fn counter_listings_parse() {
        let listing = "\
table inet zonewall {
	counter cnt_lan_tcp {
		packets 512 bytes 40960
	}
	counter cnt_lan_udp {
		packets 0 bytes 0
	}
}
";
        let counters = parse_counters(listing);
        assert_eq!(counters.len(), 2);
        assert_eq!(counters[0].name, "cnt_lan_tcp");
        assert_eq!(counters[0].packets, 512);
        assert_eq!(counters[0].bytes, 40960);
    }

    #[test]
    fn set_listings_parse() {
        let listing = "\
table inet zonewall {
	set blocked {
		type ipv4_addr
		elements = { 1.2.3.4, 10.0.0.0,
			     192.0.2.7 }
	}
}
";
        let elements = parse_set_elements(listing);
        assert_eq!(elements, vec!["1.2.3.4", "10.0.0.0", "192.0.2.7"]);
    }
}
