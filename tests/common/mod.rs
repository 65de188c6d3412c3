#![allow(dead_code)]

use futures::StreamExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rpmforge::broadcast::LogItem;
use rpmforge::config::RuntimeKind;
use rpmforge::ServerConfig;

/// Stands in for rpmbuild: checks the checkout, writes one binary and one
/// source package into the topdir and announces them like rpmbuild does.
pub const FAKE_RPMBUILD: &str = r#"set -e
test -f "$RPMFORGE_SRC/hello.spec"
echo "building hello $(cat "$RPMFORGE_SRC/VERSION") for $RPMFORGE_OS"
mkdir -p "$RPMFORGE_TOPDIR/RPMS/noarch" "$RPMFORGE_TOPDIR/SRPMS"
printf 'rpm-%s' "$RPMFORGE_OS" > "$RPMFORGE_TOPDIR/RPMS/noarch/hello-1.0-1.noarch.rpm"
echo "Wrote: $RPMFORGE_TOPDIR/RPMS/noarch/hello-1.0-1.noarch.rpm"
printf 'srpm' > "$RPMFORGE_TOPDIR/SRPMS/hello-1.0-1.src.rpm"
echo "Wrote: $RPMFORGE_TOPDIR/SRPMS/hello-1.0-1.src.rpm"
"#;

pub const TIMEOUT: Duration = Duration::from_secs(60);

fn commit_all(repo: &git2::Repository, message: &str, update_ref: &str) -> git2::Oid {
    let mut index = repo.index().expect("Failed to get index");
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .expect("Failed to add files");
    index
        .update_all(["*"].iter(), None)
        .expect("Failed to stage removals");
    index.write().expect("Failed to write index");
    let tree_id = index.write_tree().expect("Failed to write tree");
    let tree = repo.find_tree(tree_id).expect("Failed to find tree");
    let sig = git2::Signature::now("Test User", "test@example.com").expect("Failed to create signature");
    let parents: Vec<git2::Commit> = repo
        .refname_to_id(update_ref)
        .ok()
        .and_then(|id| repo.find_commit(id).ok())
        .into_iter()
        .collect();
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
    repo.commit(Some(update_ref), &sig, &sig, message, &tree, &parent_refs)
        .expect("Failed to commit")
}

/// Source repository with branch `main` (VERSION 2.0), tag `v1.0`
/// (VERSION 1.0) and branch `no-spec` without a spec file.
pub fn fixture_repo(root: &Path) -> PathBuf {
    let path = root.join("origin");
    let repo = git2::Repository::init(&path).expect("Failed to init source repo");

    fs::write(path.join("hello.spec"), "Name: hello\nVersion: 1.0\n").unwrap();
    fs::write(path.join("VERSION"), "1.0").unwrap();
    let first = commit_all(&repo, "Initial commit", "refs/heads/main");
    let obj = repo.find_object(first, None).unwrap();
    let sig = git2::Signature::now("Test User", "test@example.com").unwrap();
    repo.tag("v1.0", &obj, &sig, "release 1.0", false)
        .expect("Failed to tag");

    fs::write(path.join("VERSION"), "2.0").unwrap();
    commit_all(&repo, "Bump version", "refs/heads/main");

    repo.branch("no-spec", &repo.find_commit(first).unwrap(), false)
        .expect("Failed to branch");
    fs::remove_file(path.join("hello.spec")).unwrap();
    commit_all(&repo, "Drop spec", "refs/heads/no-spec");

    repo.set_head("refs/heads/main").unwrap();
    path
}

/// Add branch `name` holding the working tree plus `files` generated
/// ones, enough to keep a checkout busy for a while.
pub fn add_bulk_branch(origin: &Path, name: &str, files: usize) {
    let repo = git2::Repository::open(origin).expect("Failed to open source repo");
    let bulk = origin.join("bulk");
    fs::create_dir_all(&bulk).unwrap();
    for i in 0..files {
        fs::write(bulk.join(format!("file-{:05}.txt", i)), format!("{}\n", i).repeat(64)).unwrap();
    }
    commit_all(&repo, "Bulk content", &format!("refs/heads/{}", name));
    fs::remove_dir_all(&bulk).unwrap();
}

pub fn file_url(path: &Path) -> String {
    url::Url::from_file_path(path)
        .expect("absolute path")
        .to_string()
}

/// Host-runtime config rooted in `root`, running `script` as the build.
pub fn host_config(root: &Path, script: &str) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.paths.work_root = root.join("work");
    config.paths.artifact_root = root.join("artifacts");
    config.paths.log_dir = root.join("logs");
    config.sandbox.runtime = RuntimeKind::Host;
    config.sandbox.memory_limit_mb = 0;
    config.sandbox.cpu_time_limit_secs = 0;
    for profile in config.sandbox.profiles.values_mut() {
        profile.script = Some(script.to_string());
    }
    config.validation.allowed_schemes.push("file".to_string());
    config.limits.max_concurrent_builds = 4;
    config.limits.fetch_timeout_secs = 30;
    config.limits.fetch_retries = 1;
    config.limits.build_timeout_secs = 30;
    config.limits.kill_grace_ms = 300;
    config.limits.cancel_grace_ms = 1000;
    config
}

/// Drain a subscription into one string, rendering lag markers.
pub async fn collect_text(mut logs: futures::stream::BoxStream<'static, LogItem>) -> String {
    let mut text = String::new();
    while let Some(item) = logs.next().await {
        match item {
            LogItem::Chunk(chunk) => text.push_str(&chunk.text),
            LogItem::Lagged { skipped } => text.push_str(&format!("<lagged {}>\n", skipped)),
        }
    }
    text
}
