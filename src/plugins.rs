use std::fs;
use std::io;
use std::path::{self, Path, PathBuf};
use std::process::Command;

use log::debug;

/// One executable found in the plugin directory. The set of descriptors is
/// recomputed on every `list` command so the directory contents are never
/// stale across commands.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub path: PathBuf,
    pub executable: bool,
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    // No executable bit to check; any regular file counts.
    true
}

/// Enumerate the plugin directory. Every regular file becomes a descriptor;
/// callers decide how to treat entries without the executable bit. Names are
/// sorted so `list` output is stable run to run.
pub fn scan(dir: &Path) -> io::Result<Vec<PluginDescriptor>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        // Follow symlinks so a linked plugin is classified by its target.
        let meta = match fs::metadata(entry.path()) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.is_dir() {
            continue;
        }
        found.push(PluginDescriptor {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path(),
            executable: is_executable(&meta),
        });
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

/// Resolve a plugin by exact name inside the plugin directory. Returns None
/// when the name does not map to an executable regular file, including names
/// that try to escape the directory with a path separator.
pub fn resolve(dir: &Path, name: &str) -> Option<PluginDescriptor> {
    if name.is_empty() || name.contains(path::is_separator) {
        return None;
    }
    let path = dir.join(name);
    let meta = fs::metadata(&path).ok()?;
    if meta.is_dir() || !is_executable(&meta) {
        return None;
    }
    Some(PluginDescriptor {
        name: name.to_string(),
        path,
        executable: true,
    })
}

/// Seam for running plugin executables. The dispatcher only ever sees
/// captured stdout; tests substitute a recording implementation to assert
/// which plugins were (not) spawned.
pub trait Executor {
    /// Run `path` with a single positional argument and return its full
    /// stdout. The child is run to completion; its exit code is ignored.
    fn run(&self, path: &Path, arg: &str) -> io::Result<Vec<u8>>;
}

/// Real executor backed by `std::process::Command`.
pub struct CommandExecutor;

impl Executor for CommandExecutor {
    fn run(&self, path: &Path, arg: &str) -> io::Result<Vec<u8>> {
        debug!("executing {} with arg {:?}", path.display(), arg);
        let output = Command::new(path).arg(arg).output()?;
        Ok(output.stdout)
    }
}
