//! The configuration document.
//!
//! The document is the operator's declarative description of the whole
//! router: zones, interfaces, policies, NAT, address sets, routes, and the
//! service subsystems.  This module parses it into a typed, versioned
//! specification.
//!
//! Versioning follows the same scheme as every other file Zonewall owns:
//! each schema version is a module with its own types, the current version
//! is what the rest of the daemon consumes, and older versions migrate
//! forward through a chain of `Spec_{vN} -> Spec_{vN+1}` steps.  A document
//! declares its version with a top-level `schema_version` key; documents
//! without one are taken to be current.
//!
//! Parsing is total: any syntactically invalid input produces a structured
//! parse error with line and column.  Defaults are materialized here, so
//! the validator and graph builder see fully populated specifications.

use zonewall_api::ApiError;

pub mod v1;
pub mod v2;

/// The schema version written by `zonewall config get` and the docs.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Sensitive key names, masked wherever they appear in service blocks.
const SENSITIVE_KEYS: [&str; 6] = [
    "private_key",
    "password",
    "secret",
    "token",
    "psk",
    "webhook_url",
];

//----------- Parsing ----------------------------------------------------------

/// Parse a document into the current specification.
///
/// Older schema versions are migrated forward; unknown versions are
/// rejected.
pub fn parse(text: &str) -> Result<v2::Spec, ApiError> {
    // Peek at the declared schema version before committing to a shape.
    #[derive(serde::Deserialize)]
    struct Probe {
        schema_version: Option<u32>,
    }

    let probe: Probe = toml::from_str(text).map_err(|err| parse_error(text, &err))?;

    match probe.schema_version.unwrap_or(CURRENT_SCHEMA_VERSION) {
        1 => {
            let spec: v1::Spec = toml::from_str(text).map_err(|err| parse_error(text, &err))?;
            Ok(spec.migrate())
        }
        2 => toml::from_str(text).map_err(|err| parse_error(text, &err)),
        other => Err(ApiError::Validate {
            path: "schema_version".into(),
            reason: format!(
                "schema version {other} is newer than this daemon understands \
                 (current is {CURRENT_SCHEMA_VERSION})"
            ),
        }),
    }
}

/// Map a TOML error to the structured parse error.
fn parse_error(text: &str, err: &toml::de::Error) -> ApiError {
    let (line, column) = match err.span() {
        Some(span) => position(text, span.start),
        None => (0, 0),
    };
    ApiError::Parse {
        line,
        column,
        expected: err.message().to_string(),
    }
}

/// 1-based line and column of a byte offset.
fn position(text: &str, offset: usize) -> (usize, usize) {
    let clamped = offset.min(text.len());
    let before = &text[..clamped];
    let line = before.bytes().filter(|&b| b == b'\n').count() + 1;
    let column = before
        .rfind('\n')
        .map(|nl| clamped - nl)
        .unwrap_or(clamped + 1);
    (line, column)
}

//----------- Masking ----------------------------------------------------------

/// Render a specification back to document text with sensitive fields
/// replaced by the opaque placeholder.
///
/// Only service blocks carry credentials (WireGuard private keys, DDNS
/// secrets, webhook tokens); the firewall entities themselves hold nothing
/// sensitive.
pub fn masked_document(spec: &v2::Spec) -> Result<String, ApiError> {
    let mut masked = spec.clone();
    for table in masked.service_blocks_mut() {
        mask_table(table);
    }
    toml::to_string_pretty(&masked).map_err(|err| ApiError::Internal {
        reason: format!("could not render the configuration: {err}"),
    })
}

fn mask_table(table: &mut toml::Table) {
    for (key, value) in table.iter_mut() {
        match value {
            toml::Value::Table(inner) => mask_table(inner),
            toml::Value::Array(items) => {
                for item in items {
                    if let toml::Value::Table(inner) = item {
                        mask_table(inner);
                    }
                }
            }
            other => {
                if SENSITIVE_KEYS.iter().any(|s| key.contains(s)) {
                    *other = toml::Value::String(zonewall_api::REDACTED.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reports_line_and_column() {
        let text = "schema_version = 2\n[[zone]\nname = \"lan\"\n";
        let err = parse(text).unwrap_err();
        let ApiError::Parse { line, .. } = err else {
            panic!("expected a parse error, got {err:?}");
        };
        assert_eq!(line, 2);
    }

    #[test]
    fn unknown_schema_versions_are_rejected() {
        let err = parse("schema_version = 99\n").unwrap_err();
        assert!(matches!(err, ApiError::Validate { .. }));
    }

    #[test]
    fn missing_schema_version_means_current() {
        let spec = parse("[[zone]]\nname = \"lan\"\n").unwrap();
        assert_eq!(spec.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(spec.zone.len(), 1);
    }

    #[test]
    fn v1_documents_migrate_forward() {
        let text = r#"
schema_version = 1

[[zone]]
name = "lan"
management = ["ssh", "api"]

[[policy]]
from = "lan"
to = "wan"
default_action = "accept"

[[policy.rule]]
name = "games"
action = "drop"
protocol = "tcp"
ports = "6881-6889,6969"
"#;
        let spec = parse(text).unwrap();
        assert_eq!(spec.schema_version, CURRENT_SCHEMA_VERSION);

        let zone = &spec.zone[0];
        assert!(zone.management.ssh);
        assert!(zone.management.api);
        assert!(!zone.management.web_ui);

        let policy = &spec.policy[0];
        assert_eq!(policy.default, "accept");
        let ports = &policy.rule[0].ports;
        assert_eq!(ports.len(), 2);
    }

    #[test]
    fn masking_redacts_service_credentials_only() {
        let text = r#"
[[zone]]
name = "lan"

[wireguard]
listen_port = 51820
private_key = "hunter2"

[notifications]
webhook_url = "https://hooks.example/secret-path"
"#;
        let spec = parse(text).unwrap();
        let masked = masked_document(&spec).unwrap();
        assert!(!masked.contains("hunter2"));
        assert!(!masked.contains("secret-path"));
        assert!(masked.contains(zonewall_api::REDACTED));
        assert!(masked.contains("listen_port = 51820"));
        assert!(masked.contains("name = \"lan\""));
    }
}
