use std::{
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tokio::task;
use tracing::{info, warn};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use crate::error::BackupError;

/// Archive naming: `<prefix>_<timestamp>.zip` where the timestamp is ISO 8601
/// with `:` flattened so the name is filesystem-safe and sorts
/// lexicographically in chronological order. Retention relies on that sort.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";

/// What a backup archive was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupSource {
    World,
    Jar,
}

impl BackupSource {
    fn prefix(&self) -> &'static str {
        match self {
            BackupSource::World => "world",
            BackupSource::Jar => "jar",
        }
    }
}

/// A completed backup archive. Never mutated after creation; retention may
/// delete the file it points at.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub timestamp: DateTime<Utc>,
    pub archive_path: PathBuf,
    pub source: BackupSource,
}

/// Archives the world directory and server jar before mutating operations
/// and prunes old archives past the retention cap.
#[derive(Debug, Clone)]
pub struct BackupManager {
    world_backup_dir: PathBuf,
    jar_backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(world_backup_dir: impl Into<PathBuf>, jar_backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            world_backup_dir: world_backup_dir.into(),
            jar_backup_dir: jar_backup_dir.into(),
        }
    }

    /// Archives the whole world directory into a timestamped zip.
    ///
    /// The archive is built under a temporary name and renamed into place
    /// only once fully written; a partial archive is never visible under the
    /// final name.
    pub async fn backup_world(&self, world_dir: &Path) -> Result<BackupRecord, BackupError> {
        if !world_dir.is_dir() {
            return Err(BackupError::MissingSource(world_dir.to_path_buf()));
        }
        self.archive(world_dir, BackupSource::World).await
    }

    /// Archives the server jar into a timestamped zip.
    pub async fn backup_jar(&self, jar_path: &Path) -> Result<BackupRecord, BackupError> {
        if !jar_path.is_file() {
            return Err(BackupError::MissingSource(jar_path.to_path_buf()));
        }
        self.archive(jar_path, BackupSource::Jar).await
    }

    async fn archive(
        &self,
        source_path: &Path,
        source: BackupSource,
    ) -> Result<BackupRecord, BackupError> {
        let dir = self.dir_for(source);
        tokio::fs::create_dir_all(dir).await.map_err(|e| BackupError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let timestamp = Utc::now();
        let name = format!(
            "{}_{}.zip",
            source.prefix(),
            timestamp.format(TIMESTAMP_FORMAT)
        );
        let final_path = dir.join(&name);
        let tmp_path = dir.join(format!("{name}.tmp"));

        let src = source_path.to_path_buf();
        let tmp = tmp_path.clone();
        let result = task::spawn_blocking(move || {
            if src.is_dir() {
                zip_dir(&src, &tmp)
            } else {
                zip_file(&src, &tmp)
            }
        })
        .await
        .map_err(|_| BackupError::TaskCancelled)?;

        if let Err(e) = result {
            // Leave nothing behind under any name on failure.
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| BackupError::Io {
                path: final_path.clone(),
                source: e,
            })?;

        info!(archive = %final_path.display(), "backup completed");

        Ok(BackupRecord {
            timestamp,
            archive_path: final_path,
            source,
        })
    }

    /// Deletes archives beyond the newest `max` per source kind, oldest
    /// first. Deletion failures are logged and skipped; pruning is cleanup,
    /// not a gate on the operation that requested it.
    pub async fn enforce_retention(&self, max: usize) -> Vec<PathBuf> {
        let mut deleted = Vec::new();
        for source in [BackupSource::World, BackupSource::Jar] {
            deleted.extend(self.prune(source, max).await);
        }
        deleted
    }

    async fn prune(&self, source: BackupSource, max: usize) -> Vec<PathBuf> {
        let dir = self.dir_for(source);
        let prefix = format!("{}_", source.prefix());

        let mut archives = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".zip") {
                archives.push(entry.path());
            }
        }

        // Names sort chronologically; oldest first.
        archives.sort();
        if archives.len() <= max {
            return Vec::new();
        }

        let mut deleted = Vec::new();
        let excess = archives.len() - max;
        for path in archives.into_iter().take(excess) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!(archive = %path.display(), "pruned old backup");
                    deleted.push(path);
                }
                Err(e) => {
                    warn!(archive = %path.display(), error = %e, "failed to prune backup");
                }
            }
        }
        deleted
    }

    fn dir_for(&self, source: BackupSource) -> &Path {
        match source {
            BackupSource::World => &self.world_backup_dir,
            BackupSource::Jar => &self.jar_backup_dir,
        }
    }
}

fn zip_dir(src: &Path, dest: &Path) -> Result<(), BackupError> {
    let file = std::fs::File::create(dest).map_err(|e| BackupError::Io {
        path: dest.to_path_buf(),
        source: e,
    })?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut stack = vec![src.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| BackupError::Io {
            path: dir.clone(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| BackupError::Io {
                path: dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            let rel = path
                .strip_prefix(src)
                .expect("entry path is under the source root");
            let name = rel.to_string_lossy().replace('\\', "/");

            if path.is_dir() {
                writer.add_directory(name, options)?;
                stack.push(path);
            } else {
                writer.start_file(name, options)?;
                let mut reader = std::fs::File::open(&path).map_err(|e| BackupError::Io {
                    path: path.clone(),
                    source: e,
                })?;
                io::copy(&mut reader, &mut writer).map_err(|e| BackupError::Io {
                    path: path.clone(),
                    source: e,
                })?;
            }
        }
    }

    writer.finish()?;
    Ok(())
}

fn zip_file(src: &Path, dest: &Path) -> Result<(), BackupError> {
    let file = std::fs::File::create(dest).map_err(|e| BackupError::Io {
        path: dest.to_path_buf(),
        source: e,
    })?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "server.jar".to_string());
    writer.start_file(name, options)?;

    let mut reader = std::fs::File::open(src).map_err(|e| BackupError::Io {
        path: src.to_path_buf(),
        source: e,
    })?;
    io::copy(&mut reader, &mut writer).map_err(|e| BackupError::Io {
        path: src.to_path_buf(),
        source: e,
    })?;

    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(root: &Path) -> BackupManager {
        BackupManager::new(root.join("world_backups"), root.join("jar_backups"))
    }

    #[tokio::test]
    async fn world_backup_creates_named_archive() {
        let dir = tempfile::tempdir().unwrap();
        let world = dir.path().join("world");
        std::fs::create_dir_all(world.join("region")).unwrap();
        std::fs::write(world.join("level.dat"), b"level").unwrap();
        std::fs::write(world.join("region/r.0.0.mca"), b"chunks").unwrap();

        let record = manager(dir.path()).backup_world(&world).await.unwrap();

        assert_eq!(record.source, BackupSource::World);
        let name = record.archive_path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("world_"));
        assert!(name.ends_with(".zip"));
        assert!(record.archive_path.is_file());

        // No temp file may survive next to the finished archive.
        let leftovers: Vec<_> = std::fs::read_dir(record.archive_path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn jar_backup_creates_archive() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("minecraft_server.jar");
        std::fs::write(&jar, b"not really a jar").unwrap();

        let record = manager(dir.path()).backup_jar(&jar).await.unwrap();
        assert_eq!(record.source, BackupSource::Jar);
        assert!(record.archive_path.is_file());
    }

    #[tokio::test]
    async fn missing_world_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = manager(dir.path())
            .backup_world(&dir.path().join("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::MissingSource(_)));
    }

    #[tokio::test]
    async fn retention_keeps_newest_three_of_five() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("world_backups");
        std::fs::create_dir_all(&backups).unwrap();

        let names = [
            "world_2026-01-01T00-00-00.000.zip",
            "world_2026-01-02T00-00-00.000.zip",
            "world_2026-01-03T00-00-00.000.zip",
            "world_2026-01-04T00-00-00.000.zip",
            "world_2026-01-05T00-00-00.000.zip",
        ];
        for name in names {
            std::fs::write(backups.join(name), b"zip").unwrap();
        }

        let deleted = manager(dir.path()).enforce_retention(3).await;

        // Oldest two go, in timestamp order.
        let deleted_names: Vec<_> = deleted
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(deleted_names, vec![names[0], names[1]]);
        for name in &names[..2] {
            assert!(!backups.join(name).exists());
        }
        for name in &names[2..] {
            assert!(backups.join(name).exists());
        }
    }

    #[tokio::test]
    async fn retention_under_cap_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("world_backups");
        std::fs::create_dir_all(&backups).unwrap();
        std::fs::write(backups.join("world_2026-01-01T00-00-00.000.zip"), b"zip").unwrap();

        let deleted = manager(dir.path()).enforce_retention(3).await;
        assert!(deleted.is_empty());
    }

    #[tokio::test]
    async fn retention_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("world_backups");
        std::fs::create_dir_all(&backups).unwrap();
        for i in 1..=4 {
            std::fs::write(
                backups.join(format!("world_2026-01-0{i}T00-00-00.000.zip")),
                b"zip",
            )
            .unwrap();
        }
        std::fs::write(backups.join("notes.txt"), b"keep me").unwrap();

        manager(dir.path()).enforce_retention(3).await;
        assert!(backups.join("notes.txt").exists());
    }
}
