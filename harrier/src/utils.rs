use std::fs::{self, create_dir_all};
use std::io::{self, ErrorKind};
use std::path::Path;

pub fn ensure_dir_exists(p: &Path) -> io::Result<()> {
    if p.exists() {
        return Ok(());
    }

    create_dir_all(p)
}

/// The path as a `&str`, for handing to external commands
pub fn path_str(path: &Path) -> crate::Result<&str> {
    path.to_str()
        .ok_or_else(|| crate::Error::InvalidPath(path.to_string_lossy().into_owned()))
}

pub fn read_file(path: &Path) -> crate::Result<String> {
    match fs::read_to_string(path) {
        Ok(v) => Ok(v),
        Err(e) => match e.kind() {
            ErrorKind::NotFound => Err(crate::Error::MissingFile(
                path.to_string_lossy().into_owned(),
            )),
            _ => Err(e.into()),
        },
    }
}

pub fn read_file_bytes(path: &Path) -> crate::Result<Vec<u8>> {
    match fs::read(path) {
        Ok(v) => Ok(v),
        Err(e) => match e.kind() {
            ErrorKind::NotFound => Err(crate::Error::MissingFile(
                path.to_string_lossy().into_owned(),
            )),
            _ => Err(e.into()),
        },
    }
}
