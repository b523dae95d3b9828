use std::io::{self, Write};
use std::path::Path;

use tempfile::Builder;

#[cfg(unix)]
use std::fs::Permissions;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Replaces `path` with `contents` so readers never see a partial file.
///
/// The payload is written to a private temporary sibling, synced, then
/// renamed into place.
pub(super) fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let directory = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "runtime file has no parent directory")
    })?;
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("kilnd");

    let mut builder = Builder::new();
    builder.prefix(prefix).suffix(".tmp");
    #[cfg(unix)]
    builder.permissions(Permissions::from_mode(0o600));

    let mut file = builder.tempfile_in(directory)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}
