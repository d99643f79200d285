use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const AGENT_CONFIG: &str = "VENUE_AGENT_CONFIG";

const DEFAULT_AGENT_CONFIG: &str = "./agent.toml";

pub fn get_agent_config_path() -> PathBuf {
    std::env::var(AGENT_CONFIG).map_or(PathBuf::from(DEFAULT_AGENT_CONFIG), PathBuf::from)
}

const REGISTRY_CONFIG: &str = "VENUE_REGISTRY_CONFIG";

const DEFAULT_REGISTRY_CONFIG: &str = "./registry.toml";

pub fn get_registry_config_path() -> PathBuf {
    std::env::var(REGISTRY_CONFIG).map_or(PathBuf::from(DEFAULT_REGISTRY_CONFIG), PathBuf::from)
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Replace `path` with `contents` so readers only ever see the old or the new file.
///
/// The temp file lives next to the target so the rename stays on one filesystem.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    write_atomic_with(path, contents, None)
}

/// [`write_atomic`] for secrets: the file is owner-only from the moment it exists.
pub fn write_atomic_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    write_atomic_with(path, contents, Some(0o600))
}

fn write_atomic_with(path: &Path, contents: &[u8], mode: Option<u32>) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("state"));
    let tmp = dir.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let result = (|| {
        let mut file = create_file(&tmp, mode)?;
        file.write_all(contents)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

#[cfg(unix)]
fn create_file(path: &Path, mode: Option<u32>) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    if let Some(mode) = mode {
        options.mode(mode);
    }
    options.open(path)
}

#[cfg(not(unix))]
fn create_file(path: &Path, _mode: Option<u32>) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}
