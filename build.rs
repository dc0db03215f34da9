use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

const VERSION_OVERRIDE: &str = "LEDGERLINK_BUILD_VERSION";

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-env-changed={}", VERSION_OVERRIDE);

    let version = std::env::var(VERSION_OVERRIDE)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.trim().trim_start_matches('v').to_string())
        .or_else(git_version)
        .unwrap_or_else(|| format!("0.0.0-unknown-{}", build_time()));

    println!("cargo:rustc-env=LEDGERLINK_VERSION={}", version);
}

/// Version from the nearest tag. Untagged or dirty trees get a build-time
/// suffix so two local builds never report the same version.
fn git_version() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())?;

    let described = String::from_utf8(output.stdout).ok()?;
    let described = described.trim().trim_start_matches('v');
    if described.is_empty() {
        return None;
    }

    if described.ends_with("-dirty") {
        Some(format!("{}-{}", described, build_time()))
    } else {
        Some(described.to_string())
    }
}

fn build_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
