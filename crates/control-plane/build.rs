use std::{env, fs, path::PathBuf, process::Command};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};

/// Build metadata baked into the control-plane binary.
struct BuildInfo {
    version: String,
    git_sha: String,
    dirty: bool,
    built_at: String,
}

impl BuildInfo {
    fn collect() -> anyhow::Result<Self> {
        let version = env::var("CARGO_PKG_VERSION").context("CARGO_PKG_VERSION not set")?;
        let git_sha = override_var("PAAS_GIT_SHA")
            .or_else(|| git(&["rev-parse", "--short=12", "HEAD"]))
            .unwrap_or_else(|| "unknown".to_string());
        let dirty = match override_var("PAAS_GIT_DIRTY") {
            Some(value) => matches!(value.as_str(), "1" | "true" | "yes"),
            None => git(&["status", "--porcelain", "--untracked-files=no"]).is_some(),
        };
        Ok(Self {
            version,
            git_sha,
            dirty,
            built_at: build_time()?,
        })
    }

    fn render(&self) -> String {
        let dirty_suffix = if self.dirty { "-dirty" } else { "" };
        let full = format!(
            "{} ({}{dirty_suffix}, built {})",
            self.version, self.git_sha, self.built_at
        );
        format!(
            "pub const VERSION: &str = {:?};\n\
             pub const GIT_SHA: &str = {:?};\n\
             pub const GIT_DIRTY: bool = {};\n\
             pub const BUILD_TIMESTAMP: &str = {:?};\n\
             pub const FULL_VERSION: &str = {full:?};\n",
            self.version, self.git_sha, self.dirty, self.built_at
        )
    }
}

fn main() -> anyhow::Result<()> {
    let info = BuildInfo::collect()?;
    let out_dir = PathBuf::from(env::var("OUT_DIR").context("OUT_DIR not set")?);
    fs::write(out_dir.join("version.rs"), info.render()).context("write version.rs")?;

    for var in ["PAAS_GIT_SHA", "PAAS_GIT_DIRTY", "SOURCE_DATE_EPOCH"] {
        println!("cargo:rerun-if-env-changed={var}");
    }
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/index");
    Ok(())
}

fn override_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Trimmed stdout of a successful git command, `None` when empty or failed.
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!stdout.is_empty()).then_some(stdout)
}

/// Honors `SOURCE_DATE_EPOCH` for reproducible builds.
fn build_time() -> anyhow::Result<String> {
    let at = match override_var("SOURCE_DATE_EPOCH") {
        Some(epoch) => {
            let secs: i64 = epoch.parse().context("SOURCE_DATE_EPOCH is not an integer")?;
            DateTime::<Utc>::from_timestamp(secs, 0).context("SOURCE_DATE_EPOCH out of range")?
        }
        None => Utc::now(),
    };
    Ok(at.to_rfc3339_opts(SecondsFormat::Secs, true))
}
