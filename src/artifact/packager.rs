//! Collects built packages from the workspace and bundles them into one
//! gzip-compressed tar archive.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::ArtifactStore;
use crate::broadcast::SessionLogSink;
use crate::error::BuildError;
use crate::models::{ArtifactRef, SessionId};

/// Every `*.rpm` under `RPMS/` (and `SRPMS/` when requested), sorted.
pub fn collect_packages(topdir: &Path, include_srpms: bool) -> io::Result<Vec<PathBuf>> {
    let mut roots = vec![topdir.join("RPMS")];
    if include_srpms {
        roots.push(topdir.join("SRPMS"));
    }

    let mut found = Vec::new();
    for root in roots.iter().filter(|r| r.is_dir()) {
        for entry in WalkDir::new(root).sort_by(|a, b| a.path().cmp(b.path())) {
            let entry = entry.map_err(|e| {
                io::Error::new(io::ErrorKind::Other, format!("walking {}: {}", root.display(), e))
            })?;
            if entry.file_type().is_file()
                && entry.path().extension().and_then(|e| e.to_str()) == Some("rpm")
            {
                found.push(entry.into_path());
            }
        }
    }
    Ok(found)
}

/// Write `files` into a tar.gz at `dest`, entries relative to `base`.
/// Returns the archive size in bytes.
pub fn write_archive(base: &Path, files: &[PathBuf], dest: &Path) -> io::Result<u64> {
    let out = BufWriter::new(File::create(dest)?);
    let mut builder = tar::Builder::new(GzEncoder::new(out, Compression::default()));
    builder.follow_symlinks(false);

    for path in files {
        let rel = path.strip_prefix(base).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is outside {}", path.display(), base.display()),
            )
        })?;
        let metadata = std::fs::metadata(path)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(metadata.len());
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(
            metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );
        builder.append_data(&mut header, rel, File::open(path)?)?;
    }

    let mut out = builder.into_inner()?.finish()?;
    out.flush()?;
    drop(out);
    Ok(std::fs::metadata(dest)?.len())
}

/// Write the archive to `<dir>/<file_name>` through a hidden partial file.
/// On failure the partial file is removed, and `dir` too when that leaves it
/// empty.
fn archive_into(
    dir: &Path,
    file_name: &str,
    base: &Path,
    packages: &[PathBuf],
) -> io::Result<u64> {
    let partial = dir.join(format!(".{}.partial", file_name));
    let result = write_archive(base, packages, &partial).and_then(|size| {
        std::fs::rename(&partial, dir.join(file_name))?;
        Ok(size)
    });
    if result.is_err() {
        let _ = std::fs::remove_file(&partial);
        let _ = std::fs::remove_dir(dir);
    }
    result
}

fn file_names<'a>(paths: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    paths
        .filter_map(|p| Path::new(p).file_name().and_then(|n| n.to_str()).map(str::to_string))
        .collect()
}

/// Package the session's build output and register it with the store.
///
/// `reported` are the paths announced by rpmbuild; they are only cross-checked
/// against what is on disk, the directory scan is authoritative.
pub async fn package(
    store: &ArtifactStore,
    session: SessionId,
    topdir: &Path,
    label: &str,
    reported: &[String],
    include_srpms: bool,
    sink: &SessionLogSink,
) -> Result<ArtifactRef, BuildError> {
    let scan_dir = topdir.to_path_buf();
    let packages = tokio::task::spawn_blocking(move || collect_packages(&scan_dir, include_srpms))
        .await
        .map_err(|e| BuildError::InternalError(format!("package scan panicked: {}", e)))?
        .map_err(|e| BuildError::InternalError(format!("package scan failed: {}", e)))?;

    if packages.is_empty() {
        return Err(BuildError::NoArtifactsProduced);
    }

    let on_disk = file_names(packages.iter().filter_map(|p| p.to_str()));
    let announced = file_names(reported.iter().map(String::as_str));
    for missing in announced.difference(&on_disk) {
        if missing.ends_with(".src.rpm") && !include_srpms {
            continue;
        }
        sink.line(format!("[package] warning: rpmbuild reported {} but it was not found", missing));
    }
    for extra in on_disk.difference(&announced) {
        log::debug!("[Packager] [{}] Found unreported package {}", session, extra);
    }

    for path in &packages {
        if let Ok(rel) = path.strip_prefix(topdir) {
            sink.line(format!("[package] + {}", rel.display()));
        }
    }

    let file_name = format!("{}_{}.tar.gz", label, chrono::Utc::now().timestamp());
    let dir = store.session_dir(session)?;

    let base = topdir.to_path_buf();
    let written = {
        let file_name = file_name.clone();
        tokio::task::spawn_blocking(move || archive_into(&dir, &file_name, &base, &packages))
            .await
            .map_err(|e| BuildError::InternalError(format!("archiving panicked: {}", e)))?
    };
    let size = written.map_err(|e| BuildError::InternalError(format!("archiving failed: {}", e)))?;

    sink.line(format!("[package] {} ({} bytes)", file_name, size));
    store.register(session, &file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LogBroadcaster;
    use crate::config::ArtifactSection;
    use flate2::read::GzDecoder;

    fn touch(path: &Path, bytes: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn archive_entries(path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_collect_packages_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let top = dir.path();
        touch(&top.join("RPMS/x86_64/b-1.0-1.x86_64.rpm"), b"b");
        touch(&top.join("RPMS/noarch/a-1.0-1.noarch.rpm"), b"a");
        touch(&top.join("RPMS/noarch/README"), b"no");
        touch(&top.join("SRPMS/a-1.0-1.src.rpm"), b"s");
        touch(&top.join("BUILD/stray.rpm"), b"x");

        let all = collect_packages(top, true).unwrap();
        let rel: Vec<_> = all.iter().map(|p| p.strip_prefix(top).unwrap().to_path_buf()).collect();
        assert_eq!(
            rel,
            vec![
                PathBuf::from("RPMS/noarch/a-1.0-1.noarch.rpm"),
                PathBuf::from("RPMS/x86_64/b-1.0-1.x86_64.rpm"),
                PathBuf::from("SRPMS/a-1.0-1.src.rpm"),
            ]
        );
        assert_eq!(collect_packages(top, false).unwrap().len(), 2);
    }

    #[test]
    fn test_failed_archive_leaves_nothing_behind() {
        let work = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let top = work.path();
        touch(&top.join("RPMS/noarch/a-1.0-1.noarch.rpm"), b"a");
        let packages = vec![
            top.join("RPMS/noarch/a-1.0-1.noarch.rpm"),
            top.join("RPMS/noarch/vanished-1.0-1.noarch.rpm"),
        ];

        let session_dir = store_dir.path().join("session");
        std::fs::create_dir_all(&session_dir).unwrap();
        assert!(archive_into(&session_dir, "hello_1.tar.gz", top, &packages).is_err());
        assert!(!session_dir.exists());

        // A directory that still holds something is kept
        std::fs::create_dir_all(&session_dir).unwrap();
        touch(&session_dir.join("older.tar.gz"), b"x");
        assert!(archive_into(&session_dir, "hello_2.tar.gz", top, &packages).is_err());
        let left: Vec<_> = std::fs::read_dir(&session_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(left, vec!["older.tar.gz".to_string()]);
    }

    #[test]
    fn test_collect_packages_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_packages(dir.path(), true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_package_registers_archive() {
        let work = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(store_dir.path().to_path_buf(), &ArtifactSection::default()).unwrap();
        let top = work.path().join("rpmbuild");
        touch(&top.join("RPMS/noarch/hello-1.0-1.noarch.rpm"), b"rpm payload");
        touch(&top.join("SRPMS/hello-1.0-1.src.rpm"), b"srpm payload");

        let broadcaster = LogBroadcaster::new(1 << 20, None);
        let session = SessionId::new();
        broadcaster.open(session);
        let sink = SessionLogSink::new(broadcaster.clone(), session);

        let reported = vec!["/workspace/rpmbuild/RPMS/noarch/hello-1.0-1.noarch.rpm".to_string()];
        let artifact = package(&store, session, &top, "hello", &reported, true, &sink)
            .await
            .unwrap();

        assert!(artifact.file_name.starts_with("hello_"));
        assert!(artifact.file_name.ends_with(".tar.gz"));
        let path = store.resolve(session, &artifact.file_name).unwrap();
        assert_eq!(
            archive_entries(&path),
            vec!["RPMS/noarch/hello-1.0-1.noarch.rpm", "SRPMS/hello-1.0-1.src.rpm"]
        );
        broadcaster.flush().await.unwrap();
        let text = broadcaster.buffered_text(session).unwrap();
        assert!(!text.contains("warning"));
    }

    #[tokio::test]
    async fn test_package_without_rpms_fails() {
        let work = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(store_dir.path().to_path_buf(), &ArtifactSection::default()).unwrap();
        let broadcaster = LogBroadcaster::new(1 << 20, None);
        let session = SessionId::new();
        broadcaster.open(session);
        let sink = SessionLogSink::new(broadcaster, session);

        let err = package(&store, session, work.path(), "x", &[], true, &sink)
            .await
            .unwrap_err();
        assert_eq!(err, BuildError::NoArtifactsProduced);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_reported_but_missing_is_logged() {
        let work = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(store_dir.path().to_path_buf(), &ArtifactSection::default()).unwrap();
        let top = work.path().to_path_buf();
        touch(&top.join("RPMS/noarch/a-1.rpm"), b"a");

        let broadcaster = LogBroadcaster::new(1 << 20, None);
        let session = SessionId::new();
        broadcaster.open(session);
        let sink = SessionLogSink::new(broadcaster.clone(), session);
        let reported = vec!["/workspace/rpmbuild/RPMS/noarch/ghost-1.rpm".to_string()];

        package(&store, session, &top, "a", &reported, true, &sink).await.unwrap();
        broadcaster.flush().await.unwrap();
        assert!(broadcaster
            .buffered_text(session)
            .unwrap()
            .contains("reported ghost-1.rpm but it was not found"));
    }
}
