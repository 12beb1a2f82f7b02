use std::ffi::OsStr;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

const DIRECTORY_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// Create or truncate the file for `resource` below `root`, creating missing directories on the
/// way. An existing component that is not a directory is an error.
pub fn open_for_writing(root: &Path, resource: &[u8]) -> io::Result<File> {
    let mut components = resource
        .split(|&b| b == b'/')
        .filter(|component| !component.is_empty())
        .peekable();
    let mut path = root.to_path_buf();
    while let Some(component) = components.next() {
        path.push(OsStr::from_bytes(component));
        if components.peek().is_none() {
            return OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(FILE_MODE)
                .open(&path);
        }
        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} is not a directory", path.display()),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                DirBuilder::new().mode(DIRECTORY_MODE).create(&path)?
            }
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "resource names no file",
    ))
}

/// Remove `path` and, for a directory, everything below it. A missing path is not an error.
///
/// Symbolic links are removed, never followed.
pub fn delete_tree(path: &Path) -> io::Result<()> {
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
