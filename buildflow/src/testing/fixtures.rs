//! Ready-made configurations for pipeline tests.

use std::path::Path;

use crate::pipeline::{BuildStepConfig, PipelineConfig, RepositoryDescriptor};

/// Two repositories `a` and `b` under `base`, where `b` depends on `a`.
///
/// The preferred order lists `b` first so that the resolved order `[a, b]`
/// comes from the dependency. Each repository has one build step that
/// appends its id to `<base>/build.log` and creates a `dist` directory.
#[must_use]
pub fn two_repository_config(base: &Path) -> PipelineConfig {
    let log = base.join("build.log");
    let step = |id: &str| {
        BuildStepConfig::new(
            id,
            format!("Build {id}"),
            format!("echo {id} >> '{}' && mkdir -p dist", log.display()),
        )
    };

    let mut config = PipelineConfig::new(base)
        .with_repository(RepositoryDescriptor::new("a", "https://example.com/a.git"))
        .with_repository(RepositoryDescriptor::new("b", "https://example.com/b.git"))
        .with_dependency("b", "a")
        .with_build_step(step("a"))
        .with_build_step(step("b"));
    config.build_order.order = vec!["b".to_string(), "a".to_string()];
    config
}

/// Creates `relative` under `root` with `contents`, making parent
/// directories as needed.
///
/// # Panics
///
/// Panics if the file cannot be written.
pub fn write_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent directories");
    }
    std::fs::write(path, contents).expect("write fixture file");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_repository_config_is_valid() {
        let config = two_repository_config(Path::new("/tmp/fixture"));
        assert!(config.validate().is_ok());
        assert_eq!(
            config.repository_graph().order().unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_write_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "nested/dir/Dockerfile", "FROM scratch\n");
        assert!(dir.path().join("nested/dir/Dockerfile").is_file());
    }
}
