use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;

#[cfg(target_family = "unix")]
use std::os::unix::fs::OpenOptionsExt;

/// Sibling path used as the staging file for `path`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    sibling(path, &format!(".{}.{}.tmp", file_name(path), std::process::id()))
}

fn lock_path_for(path: &Path) -> PathBuf {
    sibling(path, &format!(".{}.lock", file_name(path)))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string())
}

fn sibling(path: &Path, name: &str) -> PathBuf {
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Serialise `value` as pretty JSON and move it onto `path` with
/// flock + fsync + atomic rename. Readers either see the previous file or
/// the complete new one; the staging file never survives a call.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let lock = File::create(lock_path_for(path))?;
    lock.lock_exclusive()?;

    let temp_path = temp_path_for(path);
    let result = stage_and_rename(path, &temp_path, value);
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }

    let _ = lock.unlock();
    result
}

fn stage_and_rename<T: Serialize>(path: &Path, temp_path: &Path, value: &T) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(target_family = "unix")]
    options.mode(0o600);

    let mut temp = options.open(temp_path)?;
    serde_json::to_writer_pretty(&mut temp, value).map_err(|err| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("Failed to serialise {}: {}", path.display(), err),
        )
    })?;
    temp.write_all(b"\n")?;
    temp.sync_all()?;
    drop(temp);

    fs::rename(temp_path, path)?;

    #[cfg(target_family = "unix")]
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }

    Ok(())
}
