use std::{
    collections::HashSet,
    fs,
    io::{self, BufRead, BufReader, Read},
    path::{Component, Path, PathBuf},
};

use flate2::read::GzDecoder;
use tar::Archive;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The prefix marking a whiteout entry. `.wh.<name>` deletes `<name>` from lower layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// The entry marking a directory opaque. Lower-layer contents of the directory are hidden.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Applies a layer archive onto `dest`.
///
/// The archive may be gzip-compressed or plain tar. Entries overwrite what lower layers left at
/// the same path, including when the file type changes. Whiteout entries delete the named path,
/// and an opaque whiteout removes every lower-layer entry of its directory. File ownership is
/// only restored when `preserve_ownership` is set; permissions and mtimes are always restored.
///
/// This is blocking and is meant to run on a blocking thread.
pub fn apply_layer(reader: impl Read, dest: &Path, preserve_ownership: bool) -> io::Result<()> {
    let mut reader = BufReader::new(reader);
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    let reader: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(preserve_ownership);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    // Removals must stay under the real root even when lower layers planted symlinks
    let root = fs::canonicalize(dest)?;

    // Paths written by this layer. Opaque whiteouts must not remove them.
    let mut written: HashSet<PathBuf> = HashSet::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = normalize_entry_path(&entry.path()?)?;

        let Some(name) = relative.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            // The archive root itself
            continue;
        };
        let parent = relative.parent().unwrap_or(Path::new(""));

        if name == OPAQUE_WHITEOUT {
            if let Some(dir) = resolve_dir(&root, parent)? {
                clear_lower_entries(&dir, parent, &written)?;
            }
            continue;
        }

        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            if hidden.is_empty() || hidden == "." || hidden == ".." {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid whiteout entry: {}", relative.display()),
                ));
            }

            if let Some(dir) = resolve_dir(&root, parent)? {
                remove_path(&dir.join(hidden))?;
            }
            continue;
        }

        if let Some(dir) = resolve_dir(&root, parent)? {
            let target = dir.join(&name);
            if let Ok(existing) = fs::symlink_metadata(&target) {
                let both_dirs = existing.is_dir() && entry.header().entry_type().is_dir();
                if !both_dirs {
                    remove_path(&target)?;
                }
            }
        }

        if !entry.unpack_in(dest)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry escapes the rootfs: {}", relative.display()),
            ));
        }

        written.insert(relative);
    }

    Ok(())
}

/// Strips `/` and `.` components and rejects `..`.
fn normalize_entry_path(path: &Path) -> io::Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("entry path contains '..': {}", path.display()),
                ))
            }
        }
    }

    Ok(normalized)
}

/// Resolves `dir` under `root`, following symlinks, and checks that the result is still inside
/// `root`. Returns `None` when the directory does not exist.
fn resolve_dir(root: &Path, dir: &Path) -> io::Result<Option<PathBuf>> {
    let resolved = match fs::canonicalize(root.join(dir)) {
        Ok(resolved) => resolved,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    if !resolved.starts_with(root) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("entry parent escapes the rootfs: {}", dir.display()),
        ));
    }

    if !resolved.is_dir() {
        return Ok(None);
    }

    Ok(Some(resolved))
}

/// Removes every child of `absolute` that the current layer did not write. `dir` is the same
/// directory relative to the rootfs.
fn clear_lower_entries(absolute: &Path, dir: &Path, written: &HashSet<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(absolute)? {
        let entry = entry?;
        let relative = dir.join(entry.file_name());
        if !written.contains(&relative) {
            remove_path(&entry.path())?;
        }
    }

    Ok(())
}

/// Removes a file, symlink or directory tree. A missing path is not an error.
fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
