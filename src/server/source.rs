//! Opening the data behind a request: a file to read, a directory listing,
//! or a file to write, with local I/O errors mapped onto TFTP error codes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Cursor, ErrorKind, Read};
use std::path::{Component, Path, PathBuf};

use crate::error::SessionError;
use crate::netascii::{self, NetasciiReader};
use crate::packet::{ErrorCode, Mode};

/// Readable side of a read request.
pub struct Source {
    pub reader: Box<dyn Read + Send>,
    /// Size of what `reader` will yield, after any netascii expansion.
    pub size: Option<u64>,
}

/// Joins `filename` onto `root`. Leading `/` is dropped; `..` is refused.
pub fn resolve(root: &Path, filename: &str) -> Result<PathBuf, SessionError> {
    let mut path = root.to_path_buf();
    for component in Path::new(filename).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(SessionError::new(
                    ErrorCode::AccessViolation,
                    ErrorCode::AccessViolation.default_message(),
                ));
            }
        }
    }
    Ok(path)
}

pub fn open_read(root: &Path, filename: &str, mode: Mode, listing: bool) -> Result<Source, SessionError> {
    let path = resolve(root, filename)?;
    if listing {
        let listing = list_directory(&path).map_err(|e| {
            log::debug!("listing {} failed: {e}", path.display());
            SessionError::new(ErrorCode::FileNotFound, "Could not open directory.")
        })?;
        return Ok(match mode {
            Mode::Octet => Source {
                size: Some(listing.len() as u64),
                reader: Box::new(Cursor::new(listing)),
            },
            Mode::Netascii => Source {
                size: netascii::encoded_len(listing.as_slice()).ok(),
                reader: Box::new(NetasciiReader::new(Cursor::new(listing))),
            },
        });
    }

    let file = File::open(&path).map_err(map_open_error)?;
    let metadata = file.metadata().map_err(map_open_error)?;
    if metadata.is_dir() {
        return Err(SessionError::new(ErrorCode::NotDefined, "Is a directory."));
    }
    Ok(match mode {
        Mode::Octet => Source {
            size: Some(metadata.len()),
            reader: Box::new(file),
        },
        Mode::Netascii => Source {
            // the size needs its own pass over the file
            size: File::open(&path)
                .and_then(|f| netascii::encoded_len(BufReader::new(f)))
                .ok(),
            reader: Box::new(NetasciiReader::new(BufReader::new(file))),
        },
    })
}

/// Creates or truncates the target of a write request.
pub fn open_write(root: &Path, filename: &str) -> Result<File, SessionError> {
    let path = resolve(root, filename)?;
    if path == root {
        return Err(SessionError::new(ErrorCode::AccessViolation, "Permission denied."));
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(map_open_error)
}

/// Entry names, sorted, one per line.
fn list_directory(path: &Path) -> io::Result<Vec<u8>> {
    let mut names = fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<io::Result<Vec<_>>>()?;
    names.sort();
    let mut listing = Vec::new();
    for name in names {
        listing.extend_from_slice(name.as_bytes());
        listing.push(b'\n');
    }
    Ok(listing)
}

pub fn map_open_error(err: io::Error) -> SessionError {
    match err.kind() {
        ErrorKind::PermissionDenied => SessionError::new(ErrorCode::AccessViolation, "Permission denied."),
        ErrorKind::NotFound => SessionError::new(ErrorCode::FileNotFound, "No such file or directory."),
        _ => SessionError::new(ErrorCode::NotDefined, err.to_string()),
    }
}

pub fn map_write_error(err: &io::Error) -> SessionError {
    match err.kind() {
        ErrorKind::StorageFull => SessionError::new(ErrorCode::DiskFull, ErrorCode::DiskFull.default_message()),
        _ => SessionError::new(ErrorCode::NotDefined, "Error writing to disk"),
    }
}
