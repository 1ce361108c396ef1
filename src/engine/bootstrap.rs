//! Worker bootstrap installed into the engine project.
//!
//! The engine loads the bootstrap as source when it starts, so it must exist
//! in the project before the first launch. The template is embedded in the
//! binary; installing substitutes the channel name and writes it to
//! `{project}/.stagehand/worker_bootstrap.lua`. An existing file is left
//! alone so local edits survive.

use std::fs;
use std::path::{Path, PathBuf};

use include_dir::{Dir, include_dir};
use tracing::{debug, info};

/// Embedded templates directory.
static TEMPLATES: Dir = include_dir!("$CARGO_MANIFEST_DIR/templates");

pub const BOOTSTRAP_TEMPLATE: &str = "worker_bootstrap.lua";

/// Subdirectory of the engine project that holds installed files.
pub const BOOTSTRAP_DIR: &str = ".stagehand";

/// Token in the template replaced by the channel name.
pub const CHANNEL_PLACEHOLDER: &str = "${STAGEHAND_CHANNEL}";

/// Result type for bootstrap operations.
pub type BootstrapResult<T> = Result<T, BootstrapError>;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Bootstrap template '{0}' is not bundled")]
    TemplateMissing(String),

    #[error("Bootstrap template '{0}' is not valid UTF-8")]
    TemplateNotUtf8(String),

    #[error("Engine project directory does not exist: {}", .0.display())]
    ProjectMissing(PathBuf),

    #[error("Failed to write bootstrap to {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What [`install_bootstrap`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed(PathBuf),
    AlreadyPresent(PathBuf),
}

impl InstallOutcome {
    pub fn path(&self) -> &Path {
        match self {
            InstallOutcome::Installed(path) | InstallOutcome::AlreadyPresent(path) => path,
        }
    }
}

/// Where the bootstrap lives inside a project.
pub fn bootstrap_path(project_dir: &Path) -> PathBuf {
    project_dir.join(BOOTSTRAP_DIR).join(BOOTSTRAP_TEMPLATE)
}

/// The bootstrap source for a channel.
pub fn render_bootstrap(channel: &str) -> BootstrapResult<String> {
    let file = TEMPLATES
        .get_file(BOOTSTRAP_TEMPLATE)
        .ok_or_else(|| BootstrapError::TemplateMissing(BOOTSTRAP_TEMPLATE.to_string()))?;
    let template = file
        .contents_utf8()
        .ok_or_else(|| BootstrapError::TemplateNotUtf8(BOOTSTRAP_TEMPLATE.to_string()))?;
    Ok(template.replace(CHANNEL_PLACEHOLDER, channel))
}

/// Materializes the bootstrap in `project_dir` unless it is already there.
pub fn install_bootstrap(project_dir: &Path, channel: &str) -> BootstrapResult<InstallOutcome> {
    if !project_dir.is_dir() {
        return Err(BootstrapError::ProjectMissing(project_dir.to_path_buf()));
    }

    let target = bootstrap_path(project_dir);
    if target.exists() {
        debug!("Bootstrap already present at {}", target.display());
        return Ok(InstallOutcome::AlreadyPresent(target));
    }

    let source = render_bootstrap(channel)?;
    let write_error = |source| BootstrapError::Write {
        path: target.clone(),
        source,
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(write_error)?;
    }
    fs::write(&target, source).map_err(write_error)?;

    info!("Installed worker bootstrap at {}", target.display());
    Ok(InstallOutcome::Installed(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_channel() -> Result<(), Box<dyn std::error::Error>> {
        let source = render_bootstrap("my-channel")?;
        assert!(source.contains("my-channel"));
        assert!(!source.contains(CHANNEL_PLACEHOLDER));
        Ok(())
    }

    #[test]
    fn test_install_then_skip() -> Result<(), Box<dyn std::error::Error>> {
        let project = tempfile::tempdir()?;

        let first = install_bootstrap(project.path(), "stagehand")?;
        assert!(matches!(first, InstallOutcome::Installed(_)));
        assert_eq!(first.path(), bootstrap_path(project.path()));

        // local edits survive a second install
        fs::write(first.path(), "-- edited")?;
        let second = install_bootstrap(project.path(), "stagehand")?;
        assert!(matches!(second, InstallOutcome::AlreadyPresent(_)));
        assert_eq!(fs::read_to_string(second.path())?, "-- edited");
        Ok(())
    }

    #[test]
    fn test_missing_project_dir() {
        let result = install_bootstrap(Path::new("/nonexistent/project"), "stagehand");
        assert!(matches!(result, Err(BootstrapError::ProjectMissing(_))));
    }
}
