//! Build environment profiles
//!
//! Maps each supported OS target to its pre-provisioned build environment
//! (container image) and the script run inside it.

use std::collections::HashMap;

use crate::config::SandboxSection;
use crate::models::OsTarget;

/// Built-in build driver.
///
/// Runs inside the sandbox with `RPMFORGE_SRC`, `RPMFORGE_TOPDIR` and
/// `RPMFORGE_OS` set. Locates spec files in the checkout, installs build
/// dependencies when the tooling is available, then runs `rpmbuild -ba`.
pub const DEFAULT_BUILD_SCRIPT: &str = r#"set -eo pipefail
cd "$RPMFORGE_SRC"

SPECS=()
while IFS= read -r -d '' SPEC; do
    SPECS+=("$SPEC")
done < <(find . -maxdepth 2 -name '*.spec' -not -path './.git/*' -print0 | sort -z)
if [ ${#SPECS[@]} -eq 0 ]; then
    echo "rpmforge: no .spec file found in repository"
    exit 2
fi

if ! command -v rpmbuild >/dev/null 2>&1; then
    echo "rpmforge: installing rpm-build"
    if command -v dnf >/dev/null 2>&1; then
        dnf install -y rpm-build dnf-plugins-core
    else
        yum install -y rpm-build yum-utils
    fi
fi

mkdir -p "$RPMFORGE_TOPDIR"/BUILD "$RPMFORGE_TOPDIR"/BUILDROOT "$RPMFORGE_TOPDIR"/RPMS \
         "$RPMFORGE_TOPDIR"/SOURCES "$RPMFORGE_TOPDIR"/SPECS "$RPMFORGE_TOPDIR"/SRPMS

for SPEC in "${SPECS[@]}"; do
    echo "rpmforge: building $SPEC for $RPMFORGE_OS"
    if command -v dnf >/dev/null 2>&1; then
        dnf builddep -y "$SPEC" || echo "rpmforge: warning: dependency installation failed"
    elif command -v yum-builddep >/dev/null 2>&1; then
        yum-builddep -y "$SPEC" || echo "rpmforge: warning: dependency installation failed"
    fi
    rpmbuild -ba \
        --define "_topdir $RPMFORGE_TOPDIR" \
        --define "_sourcedir $RPMFORGE_SRC" \
        "$SPEC"
done
"#;

/// One OS target's build environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxProfile {
    pub os: OsTarget,
    pub image: String,
    pub script: String,
}

/// OS target -> build environment lookup
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: HashMap<OsTarget, SandboxProfile>,
}

impl ProfileRegistry {
    pub fn from_section(section: &SandboxSection) -> Self {
        let mut profiles = HashMap::new();
        for os in OsTarget::ALL {
            if let Some(cfg) = section.profile(os) {
                profiles.insert(
                    os,
                    SandboxProfile {
                        os,
                        image: cfg.image.clone(),
                        script: cfg
                            .script
                            .clone()
                            .unwrap_or_else(|| DEFAULT_BUILD_SCRIPT.to_string()),
                    },
                );
            }
        }
        ProfileRegistry { profiles }
    }

    pub fn get(&self, os: OsTarget) -> Option<&SandboxProfile> {
        self.profiles.get(&os)
    }

    pub fn targets(&self) -> Vec<OsTarget> {
        let mut targets: Vec<OsTarget> = self.profiles.keys().copied().collect();
        targets.sort();
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileConfig;

    #[test]
    fn test_default_registry_maps_every_os_to_distinct_image() {
        let registry = ProfileRegistry::from_section(&SandboxSection::default());
        assert_eq!(registry.targets(), OsTarget::ALL.to_vec());

        let c7 = registry.get(OsTarget::CentOs7).unwrap();
        let c9 = registry.get(OsTarget::CentOs9).unwrap();
        assert_eq!(c7.image, "centos:7");
        assert_ne!(c7.image, c9.image);
        assert_eq!(c7.script, DEFAULT_BUILD_SCRIPT);
    }

    #[test]
    fn test_script_override() {
        let mut section = SandboxSection::default();
        section.profiles.insert(
            "CentOS8".to_string(),
            ProfileConfig {
                image: "registry.local/c8-build".to_string(),
                script: Some("make rpm".to_string()),
            },
        );
        let registry = ProfileRegistry::from_section(&section);
        let profile = registry.get(OsTarget::CentOs8).unwrap();
        assert_eq!(profile.image, "registry.local/c8-build");
        assert_eq!(profile.script, "make rpm");
    }

    fn write_executable(path: &std::path::Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, body).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_default_script_handles_spec_names_with_spaces() {
        use crate::sandbox::process::{run_streaming, HostLimits, RunOutcome, RunSpec};
        use std::time::Duration;

        let root = tempfile::tempdir().expect("Failed to create temp dir");
        let src = root.path().join("src");
        let bin = root.path().join("bin");
        std::fs::create_dir_all(src.join("pkg dir")).unwrap();
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(src.join("my pkg.spec"), "Name: mine\n").unwrap();
        std::fs::write(src.join("pkg dir").join("other.spec"), "Name: other\n").unwrap();

        // Stand-ins that record what they were asked to build
        write_executable(
            &bin.join("rpmbuild"),
            "#!/bin/sh\nfor a; do last=$a; done\necho \"rpmbuild [$last]\"\n",
        );
        write_executable(&bin.join("dnf"), "#!/bin/sh\nexit 0\n");

        let path = format!("{}:{}", bin.display(), std::env::var("PATH").unwrap_or_default());
        let spec = RunSpec {
            program: "bash".to_string(),
            args: vec!["-c".to_string(), DEFAULT_BUILD_SCRIPT.to_string()],
            envs: vec![
                ("PATH".to_string(), path),
                ("RPMFORGE_SRC".to_string(), src.display().to_string()),
                ("RPMFORGE_TOPDIR".to_string(), root.path().join("top").display().to_string()),
                ("RPMFORGE_OS".to_string(), "CentOS9".to_string()),
            ],
            cwd: root.path().to_path_buf(),
            limits: HostLimits::default(),
        };

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let mut lines = Vec::new();
        let outcome = run_streaming(
            &spec,
            &mut |l: &str| lines.push(l.to_string()),
            rx,
            Duration::from_secs(30),
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, RunOutcome::Exited(s) if s.success()), "{:?}", lines);
        let built: Vec<&String> = lines.iter().filter(|l| l.starts_with("rpmbuild [")).collect();
        assert_eq!(
            built,
            vec!["rpmbuild [./my pkg.spec]\n", "rpmbuild [./pkg dir/other.spec]\n"]
        );
    }

    #[tokio::test]
    async fn test_default_script_fails_without_spec() {
        use crate::sandbox::process::{run_streaming, HostLimits, RunOutcome, RunSpec};
        use std::time::Duration;

        let root = tempfile::tempdir().expect("Failed to create temp dir");
        let spec = RunSpec {
            program: "bash".to_string(),
            args: vec!["-c".to_string(), DEFAULT_BUILD_SCRIPT.to_string()],
            envs: vec![
                ("RPMFORGE_SRC".to_string(), root.path().display().to_string()),
                ("RPMFORGE_TOPDIR".to_string(), root.path().join("top").display().to_string()),
                ("RPMFORGE_OS".to_string(), "CentOS7".to_string()),
            ],
            cwd: root.path().to_path_buf(),
            limits: HostLimits::default(),
        };

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let mut lines = Vec::new();
        let outcome = run_streaming(
            &spec,
            &mut |l: &str| lines.push(l.to_string()),
            rx,
            Duration::from_secs(30),
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, RunOutcome::Exited(s) if s.code() == Some(2)));
        assert_eq!(lines, vec!["rpmforge: no .spec file found in repository\n"]);
    }
}
