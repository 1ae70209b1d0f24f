//! In-memory tar archives for the container archive API

use crate::error::{DockerError, PROVIDER, Result};
use fleetlab_backend::{FileUpload, FleetError};
use std::io::Read;
use tar::{Archive, Builder, EntryType, Header};

/// Tar archive holding every file at its absolute path, relative to `/`
pub fn tar_files(files: &[FileUpload]) -> Result<Vec<u8>> {
    let mut archive_data = Vec::new();
    {
        let mut tar = Builder::new(&mut archive_data);
        for file in files {
            let mut header = Header::new_gnu();
            header.set_path(file.path.trim_start_matches('/'))?;
            header.set_size(file.contents.len() as u64);
            header.set_mode(file.mode);
            header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
            header.set_cksum();
            tar.append(&header, file.contents.as_slice())?;
        }
        tar.finish()?;
    }

    tracing::debug!(files = files.len(), bytes = archive_data.len(), "archive created");
    Ok(archive_data)
}

/// Contents of the single regular file in an archive returned for `path`
pub fn untar_file(archive: &[u8], path: &str) -> Result<Vec<u8>> {
    let mut tar = Archive::new(archive);
    let mut entries = tar.entries()?;
    let Some(entry) = entries.next() else {
        return Err(DockerError::Fleet(FleetError::backend(
            PROVIDER,
            format!("{}: empty archive", path),
        )));
    };
    let mut entry = entry?;
    if entry.header().entry_type() != EntryType::Regular {
        return Err(DockerError::Fleet(FleetError::validation(format!(
            "{} is not a regular file",
            path
        ))));
    }
    let mut contents = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut contents)?;
    Ok(contents)
}
