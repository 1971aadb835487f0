//! File output helpers shared by the message-log and dump writers.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

use log::*;

/// Open an output file for appending, creating parent directories as
/// needed. Message-log files are kept in this mode across reloads.
pub fn open_append(path: &str) -> io::Result<File> {
    ensure_parent(path)?;
    OpenOptions::new().create(true).append(true).open(path)
}

/// Open an output file truncated. Dump files are rewritten from scratch
/// on every rotation.
pub fn open_truncate(path: &str) -> io::Result<File> {
    ensure_parent(path)?;
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

fn ensure_parent(path: &str) -> io::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Point the "latest" symlink at the most recent dump file, replacing any
/// previous link.
pub fn link_latest(latest: &str, target: &str) {
    if let Err(e) = relink(latest, target) {
        warn!("unable to link {} -> {}: {}", latest, target, e);
    }
}

fn relink(latest: &str, target: &str) -> io::Result<()> {
    match fs::symlink_metadata(latest) {
        Ok(_) => fs::remove_file(latest)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(target, latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn append_preserves_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.log");
        let path = path.to_str().unwrap();

        let mut f = open_append(path).unwrap();
        writeln!(f, "one").unwrap();
        drop(f);

        let mut f = open_append(path).unwrap();
        writeln!(f, "two").unwrap();
        drop(f);

        assert_eq!(fs::read_to_string(path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn truncate_discards_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        let path = path.to_str().unwrap();

        fs::write(path, "stale").unwrap();
        let mut f = open_truncate(path).unwrap();
        writeln!(f, "fresh").unwrap();
        drop(f);

        assert_eq!(fs::read_to_string(path).unwrap(), "fresh\n");
    }

    #[test]
    fn latest_link_is_replaced_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("dump-a.json");
        let b = dir.path().join("dump-b.json");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();
        let latest = dir.path().join("latest");
        let latest = latest.to_str().unwrap();

        link_latest(latest, a.to_str().unwrap());
        assert_eq!(fs::read_to_string(latest).unwrap(), "a");

        link_latest(latest, b.to_str().unwrap());
        assert_eq!(fs::read_to_string(latest).unwrap(), "b");
    }

    #[test]
    fn missing_parent_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("by-peer/10.0.0.1/peer.log");
        let f = open_append(path.to_str().unwrap()).unwrap();
        drop(f);
        assert!(path.exists());
    }
}
