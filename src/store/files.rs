//! Original-file persistence: write-once storage under a per-submission
//! directory, safe path resolution for the serving endpoint, and an
//! orphan-reaping janitor (§4.8, §5 "write-once per filename").

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use uuid::Uuid;

/// One persisted original file.
#[derive(Debug, Clone)]
pub struct StoredFile {
    /// Absolute filesystem path.
    pub absolute_path: PathBuf,
    /// Path relative to the uploads root, as served by `/api/v1/files/{relpath}`.
    pub relative_path: String,
}

/// Orphaned files older than this, with no matching submission row, are
/// reaped on the next janitor sweep (§4.8).
pub const JANITOR_MAX_ORPHAN_AGE: Duration = Duration::from_secs(3600);

/// Persist a submission's source files under `uploads_dir/{submission_id}/`.
///
/// Each file is named `{index}_{sanitized_original}` to prevent collision,
/// matching §5's `{submission_id}_{index}_{sanitized_original}` scheme
/// (the submission id is already the containing directory name here).
///
/// # Errors
///
/// Returns an error if the directory or any file cannot be written.
pub fn persist_files(
    uploads_dir: &Path,
    submission_id: Uuid,
    files: &[(String, Vec<u8>)],
) -> anyhow::Result<Vec<StoredFile>> {
    let sub_dir = uploads_dir.join(submission_id.to_string());
    std::fs::create_dir_all(&sub_dir)
        .with_context(|| format!("failed to create submission directory {}", sub_dir.display()))?;

    let mut stored = Vec::with_capacity(files.len());
    for (index, (original_name, bytes)) in files.iter().enumerate() {
        let sanitized = sanitize_filename(original_name);
        let filename = format!("{index}_{sanitized}");
        let absolute_path = sub_dir.join(&filename);
        std::fs::write(&absolute_path, bytes)
            .with_context(|| format!("failed to write {}", absolute_path.display()))?;

        stored.push(StoredFile {
            absolute_path,
            relative_path: format!("{}/{filename}", submission_id),
        });
    }

    Ok(stored)
}

/// Strip path separators and leading dots from a client-supplied filename.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let trimmed = base.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// List a submission's previously persisted files, in upload order, by
/// reading back its `{index}_{sanitized_original}` entries (§5, written by
/// [`persist_files`]). Used by rerun so every originally-uploaded file is
/// re-classified, not just the first.
///
/// # Errors
///
/// Returns an error if the submission directory cannot be listed.
pub fn list_submission_files(uploads_dir: &Path, submission_id: Uuid) -> anyhow::Result<Vec<StoredFile>> {
    let sub_dir = uploads_dir.join(submission_id.to_string());

    let mut indexed = Vec::new();
    for entry in std::fs::read_dir(&sub_dir)
        .with_context(|| format!("failed to list {}", sub_dir.display()))?
    {
        let entry = entry.context("failed to read directory entry")?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else { continue };
        let Some(index) = filename.split('_').next().and_then(|s| s.parse::<usize>().ok()) else { continue };

        indexed.push((
            index,
            StoredFile { absolute_path: path, relative_path: format!("{submission_id}/{filename}") },
        ));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, f)| f).collect())
}

/// Resolve a client-requested relative path against `uploads_dir`, refusing
/// any path that escapes it (§6 `/api/v1/files/{relpath}` "path traversal
/// blocked").
///
/// # Errors
///
/// Returns an error if the resolved path would fall outside `uploads_dir`.
pub fn resolve_safe_path(uploads_dir: &Path, relpath: &str) -> anyhow::Result<PathBuf> {
    if relpath.contains("..") || relpath.starts_with('/') || relpath.starts_with('\\') {
        anyhow::bail!("path traversal rejected: {relpath}");
    }

    let candidate = uploads_dir.join(relpath);

    let root = std::fs::canonicalize(uploads_dir).unwrap_or_else(|_| uploads_dir.to_path_buf());
    let resolved = std::fs::canonicalize(&candidate).unwrap_or(candidate);

    if !resolved.starts_with(&root) {
        anyhow::bail!("path traversal rejected: {relpath}");
    }

    Ok(resolved)
}

/// Delete per-submission directories under `uploads_dir` older than
/// [`JANITOR_MAX_ORPHAN_AGE`] whose id is not in `known_ids`.
///
/// # Errors
///
/// Returns an error if the directory cannot be listed; individual removal
/// failures are logged by the caller and do not abort the sweep.
pub fn janitor_sweep(uploads_dir: &Path, known_ids: &std::collections::HashSet<Uuid>) -> anyhow::Result<Vec<PathBuf>> {
    if !uploads_dir.exists() {
        return Ok(Vec::new());
    }

    let mut removed = Vec::new();
    let now = SystemTime::now();

    for entry in std::fs::read_dir(uploads_dir)
        .with_context(|| format!("failed to list {}", uploads_dir.display()))?
    {
        let entry = entry.context("failed to read directory entry")?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        let Ok(id) = Uuid::parse_str(name) else { continue };
        if known_ids.contains(&id) {
            continue;
        }

        let metadata = entry.metadata().context("failed to stat directory entry")?;
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();

        if age >= JANITOR_MAX_ORPHAN_AGE {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("failed to remove orphaned directory {}", path.display()))?;
            removed.push(path);
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_path_separators_in_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("report.png"), "report.png");
    }

    #[test]
    fn persist_and_resolve_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let submission_id = Uuid::new_v4();
        let files = vec![("report.png".to_owned(), b"bytes".to_vec())];
        let stored = persist_files(dir.path(), submission_id, &files).expect("persist");

        assert_eq!(stored.len(), 1);
        let resolved = resolve_safe_path(dir.path(), &stored[0].relative_path).expect("resolve");
        assert_eq!(std::fs::read(resolved).expect("read"), b"bytes");
    }

    #[test]
    fn rejects_traversal_attempts() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(resolve_safe_path(dir.path(), "../../etc/passwd").is_err());
    }

    #[test]
    fn list_submission_files_returns_every_file_in_upload_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let submission_id = Uuid::new_v4();
        let files = vec![
            ("a.png".to_owned(), b"1".to_vec()),
            ("b.png".to_owned(), b"2".to_vec()),
            ("c.png".to_owned(), b"3".to_vec()),
        ];
        persist_files(dir.path(), submission_id, &files).expect("persist");

        let listed = list_submission_files(dir.path(), submission_id).expect("list");
        assert_eq!(listed.len(), 3);
        assert!(listed[0].relative_path.starts_with(&format!("{submission_id}/0_")));
        assert!(listed[2].relative_path.starts_with(&format!("{submission_id}/2_")));
    }

    #[test]
    fn janitor_leaves_known_submissions_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let submission_id = Uuid::new_v4();
        persist_files(dir.path(), submission_id, &[("a.png".to_owned(), b"x".to_vec())]).expect("persist");

        let mut known = std::collections::HashSet::new();
        known.insert(submission_id);
        let removed = janitor_sweep(dir.path(), &known).expect("sweep");
        assert!(removed.is_empty());
    }
}
