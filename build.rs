// Embeds the git revision into the binaries so that `zonewalld --version`
// and the CLI's `--version` identify the exact build.  When the source is
// built outside a git checkout (e.g. from a release tarball), the version
// falls back to the bare package version.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::{Command, Output};

fn strip_newline(s: String) -> String {
    s.strip_suffix("\n").unwrap_or(&s).into()
}

fn run_cmd<I, S>(cmd: &str, args: I) -> Option<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(cmd).args(args).output().ok()
}

fn run_cmd_strip<I, S>(cmd: &str, args: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let out = run_cmd(cmd, args)?;
    String::from_utf8(out.stdout).ok().map(strip_newline)
}

fn main() {
    // This script is shared by the `zonewalld` and `zonewall` packages, so it
    // runs both from the project root and from `crates/cli`.
    let in_worktree = run_cmd("git", ["rev-parse", "--is-inside-work-tree"])
        .map(|out| out.status.success())
        .unwrap_or(false);

    if !in_worktree {
        match env!("CARGO_PKG_NAME") {
            "zonewalld" => println!("cargo::rerun-if-changed=.git"),
            "zonewall" => println!("cargo::rerun-if-changed=../../.git"),
            _ => {}
        }
        print_version(concat!(env!("CARGO_PKG_VERSION"), " at ", "no-git"));
        return;
    }

    let git_root = run_cmd_strip("git", ["rev-parse", "--show-toplevel"]).unwrap_or_default();

    // Re-run when the sources or the current commit change.  A missing path
    // makes cargo re-run the script unconditionally, hence the existence
    // check.
    generate_project_rerun_with_prefix(
        &git_root,
        vec!["Cargo.lock", "Cargo.toml", "build.rs", "crates/", "src/"],
    );
    if let Some(git_dir) = run_cmd_strip("git", ["rev-parse", "--git-dir"]) {
        generate_project_rerun_with_prefix(&git_dir, vec!["HEAD"]);
    }

    print_version(&generate_version_string());
}

fn generate_version_string() -> String {
    let mut git_hash =
        run_cmd_strip("git", ["rev-parse", "--short", "HEAD"]).unwrap_or("unknown".into());
    let is_dirty = run_cmd("git", ["diff-index", "--quiet", "HEAD"])
        .map(|out| !out.status.success())
        .unwrap_or(false);

    if is_dirty {
        git_hash.push_str("-dirty");
    }

    format!("{} at {}", env!("CARGO_PKG_VERSION"), git_hash)
}

fn print_version(s: &str) {
    println!("cargo::rustc-env=ZONEWALL_BUILD_VERSION={s}");
}

fn generate_project_rerun_with_prefix(prefix: &str, paths: Vec<&str>) {
    for path in paths {
        let mut p = PathBuf::from(prefix);
        p.push(path);
        if p.exists() {
            println!("cargo::rerun-if-changed={prefix}/{path}");
        }
    }
}
