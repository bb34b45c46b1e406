use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::DnsbpfError;

/// Mode of a written script: owner rwx, group r-x, no access for others.
pub const SCRIPT_MODE: u32 = 0o750;

/// Where a generated script goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    File(PathBuf),
}

impl Destination {
    /// `-` selects standard output; no argument selects `default_name`.
    pub fn resolve(write: Option<&str>, default_name: &str) -> Self {
        match write {
            Some("-") => Destination::Stdout,
            Some(path) => Destination::File(PathBuf::from(path)),
            None => Destination::File(PathBuf::from(default_name)),
        }
    }
}

/// Write a rendered script to `dest`.
pub fn write_script(dest: &Destination, contents: &str) -> Result<(), DnsbpfError> {
    match dest {
        Destination::Stdout => {
            let mut out = io::stdout().lock();
            out.write_all(contents.as_bytes())
                .and_then(|()| out.flush())
                .map_err(|source| DnsbpfError::Write {
                    path: "<stdout>".to_string(),
                    source,
                })
        }
        Destination::File(path) => write_file(path, contents),
    }
}

/// Write `contents` to `path` through a temporary file in the same directory.
///
/// `path` is replaced by a rename once the data is on disk, so it never holds a
/// partially written script.
pub fn write_file(path: &Path, contents: &str) -> Result<(), DnsbpfError> {
    let err = |source: io::Error| DnsbpfError::Write {
        path: path.display().to_string(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".dnsbpf-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(err)?;
    tmp.write_all(contents.as_bytes()).map_err(err)?;
    tmp.as_file().sync_all().map_err(err)?;
    set_script_mode(tmp.path()).map_err(err)?;
    tmp.persist(path).map_err(|e| err(e.error))?;

    log::debug!("wrote {} bytes to {}", contents.len(), path.display());
    Ok(())
}

#[cfg(unix)]
fn set_script_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SCRIPT_MODE))
}

#[cfg(not(unix))]
fn set_script_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}
