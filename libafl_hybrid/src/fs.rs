//! Filesystem helpers for snapshots and seeds

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
};

use crate::Error;

/// Replace the seed or trace tree at `path` with `bytes`.
///
/// The scheduler picks up `id:NNNNNN` files as soon as they appear, so the contents go to a hidden
/// `.id:NNNNNN.tmp` sibling first and are renamed into place once complete.
pub fn write_file_atomic<P>(path: P, bytes: &[u8]) -> Result<(), Error>
where
    P: AsRef<Path>,
{
    fn inner(path: &Path, bytes: &[u8]) -> Result<(), Error> {
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::illegal_argument(format!("{} is not a file", path.display())))?;
        let tmpfile_name = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

        let mut tmpfile = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmpfile_name)?;

        tmpfile.write_all(bytes)?;
        fs::rename(&tmpfile_name, path)?;
        Ok(())
    }
    inner(path.as_ref(), bytes)
}
