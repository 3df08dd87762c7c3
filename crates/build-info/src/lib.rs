//! Build metadata baked in by `build.rs`, surfaced in the startup banner
//! and the `/health` response.

use once_cell::sync::Lazy;

static BUILD_ID: Lazy<&'static str> = Lazy::new(|| {
    option_env!("TASKD_BUILD_ID")
        .or(option_env!("TASKD_BUILD_REVISION"))
        .unwrap_or("dev")
});

/// `<revision>@<timestamp>` unless overridden with `TASKD_BUILD_ID_OVERRIDE`.
pub fn build_id() -> &'static str {
    *BUILD_ID
}

/// One-line banner logged when a binary starts.
pub fn banner(binary: &str, version: &str) -> String {
    format!("{binary} {version} (build {})", build_id())
}
