use std::env;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=TASKD_BUILD_ID_OVERRIDE");
    println!("cargo:rerun-if-changed=../../.git/HEAD");

    let built_at = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let revision = git_revision().unwrap_or_else(|| "unversioned".to_string());

    let build_id = env::var("TASKD_BUILD_ID_OVERRIDE")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("{revision}@{built_at}"));

    println!("cargo:rustc-env=TASKD_BUILD_ID={build_id}");
    println!("cargo:rustc-env=TASKD_BUILD_REVISION={revision}");
}

fn git_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let raw = String::from_utf8_lossy(&output.stdout);
    let revision = raw.trim();
    (!revision.is_empty()).then(|| revision.to_string())
}
