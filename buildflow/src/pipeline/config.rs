//! Declarative pipeline configuration.
//!
//! Documents are JSON. Field names are snake_case; the camelCase spellings
//! produced by most front-ends are accepted as aliases.

use crate::chain::{ImageSpec, KindRetryPolicies};
use crate::core::StepKind;
use crate::errors::{ConfigError, ValidationError};
use crate::graph::DependencyGraph;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Image build settings of one repository.
pub type ImageBuildDescriptor = ImageSpec;

/// A repository taking part in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    /// Unique id.
    pub id: String,
    /// Display name; the id when empty.
    #[serde(default)]
    pub name: String,
    /// Clone URL.
    pub url: String,
    /// Clone subpath under the base clone path; the id when unset.
    #[serde(default)]
    pub path: Option<String>,
    /// Branch to check out.
    #[serde(default)]
    pub branch: Option<String>,
    /// Failures on optional repositories never fail the pipeline.
    #[serde(default)]
    pub optional: bool,
    /// Shallow clone depth.
    #[serde(default)]
    pub depth: Option<u32>,
    /// Sparse checkout paths.
    #[serde(default, alias = "sparsePaths")]
    pub sparse_paths: Vec<String>,
}

impl RepositoryDescriptor {
    /// Creates a required repository.
    #[must_use]
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            url: url.into(),
            path: None,
            branch: None,
            optional: false,
            depth: None,
            sparse_paths: Vec::new(),
        }
    }

    /// Marks the repository optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Sets the clone subpath.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Returns the display name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Returns where the repository is cloned.
    #[must_use]
    pub fn clone_path(&self, base: &Path) -> PathBuf {
        base.join(self.path.as_deref().unwrap_or(&self.id))
    }
}

/// Cross-repository ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOrder {
    /// Preferred order; repositories not listed follow in declaration order.
    pub order: Vec<String>,
    /// Repository id to the ids it depends on.
    pub dependencies: HashMap<String, Vec<String>>,
    /// Recorded for a future concurrent scheduler; builds run sequentially.
    pub parallel: bool,
}

/// One build command of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStepConfig {
    /// The repository the step builds.
    #[serde(alias = "repositoryId")]
    pub repository_id: String,
    /// Display name.
    pub name: String,
    /// Shell command.
    pub command: String,
    /// Working directory relative to the repository clone path.
    #[serde(default, alias = "workingDir")]
    pub working_dir: Option<PathBuf>,
    /// Record failures instead of failing the pipeline.
    #[serde(default, alias = "continueOnError")]
    pub continue_on_error: bool,
    /// Hard timeout in seconds.
    #[serde(default, alias = "timeoutSeconds")]
    pub timeout_seconds: Option<u64>,
    /// Explicit kind; inferred from the command when unset.
    #[serde(default)]
    pub kind: Option<StepKind>,
    /// Environment overrides.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl BuildStepConfig {
    /// Creates a build step.
    #[must_use]
    pub fn new(
        repository_id: impl Into<String>,
        name: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            repository_id: repository_id.into(),
            name: name.into(),
            command: command.into(),
            working_dir: None,
            continue_on_error: false,
            timeout_seconds: None,
            kind: None,
            env: HashMap::new(),
        }
    }

    /// Returns the explicit kind, or the one inferred from the command.
    #[must_use]
    pub fn resolved_kind(&self) -> StepKind {
        self.kind.unwrap_or_else(|| infer_step_kind(&self.command))
    }
}

/// A named group of repositories that can be selected together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    /// Unique id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Repository ids.
    #[serde(default)]
    pub repositories: Vec<String>,
    /// Whether the component is part of the default selection.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A complete pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory repositories are cloned under.
    #[serde(alias = "baseClonePath")]
    pub base_clone_path: PathBuf,
    /// Repositories in declaration order.
    pub repositories: Vec<RepositoryDescriptor>,
    /// Cross-repository ordering.
    #[serde(default, alias = "buildOrder")]
    pub build_order: BuildOrder,
    /// Build commands.
    #[serde(default, alias = "buildSteps")]
    pub build_steps: Vec<BuildStepConfig>,
    /// Image builds keyed by repository id.
    #[serde(default, alias = "imageBuilds")]
    pub image_builds: HashMap<String, ImageBuildDescriptor>,
    /// Selectable components.
    #[serde(default)]
    pub components: Vec<Component>,
    /// Environment applied to every command.
    #[serde(default, alias = "globalEnv")]
    pub global_env: HashMap<String, String>,
    /// Retry policies per step kind.
    #[serde(default)]
    pub retry: KindRetryPolicies,
}

impl PipelineConfig {
    /// Creates a configuration with no repositories.
    #[must_use]
    pub fn new(base_clone_path: impl Into<PathBuf>) -> Self {
        Self {
            base_clone_path: base_clone_path.into(),
            repositories: Vec::new(),
            build_order: BuildOrder::default(),
            build_steps: Vec::new(),
            image_builds: HashMap::new(),
            components: Vec::new(),
            global_env: HashMap::new(),
            retry: KindRetryPolicies::default(),
        }
    }

    /// Adds a repository.
    #[must_use]
    pub fn with_repository(mut self, repository: RepositoryDescriptor) -> Self {
        self.repositories.push(repository);
        self
    }

    /// Adds a build step.
    #[must_use]
    pub fn with_build_step(mut self, step: BuildStepConfig) -> Self {
        self.build_steps.push(step);
        self
    }

    /// Declares a repository dependency.
    #[must_use]
    pub fn with_dependency(mut self, repository: impl Into<String>, dependency: impl Into<String>) -> Self {
        self.build_order
            .dependencies
            .entry(repository.into())
            .or_default()
            .push(dependency.into());
        self
    }

    /// Adds an image build.
    #[must_use]
    pub fn with_image_build(mut self, repository: impl Into<String>, image: ImageBuildDescriptor) -> Self {
        self.image_builds.insert(repository.into(), image);
        self
    }

    /// Adds a component.
    #[must_use]
    pub fn with_component(mut self, component: Component) -> Self {
        self.components.push(component);
        self
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] naming the offending field.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read and
    /// [`ConfigError::Parse`] when it is malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Returns a repository by id.
    #[must_use]
    pub fn repository(&self, id: &str) -> Option<&RepositoryDescriptor> {
        self.repositories.iter().find(|r| r.id == id)
    }

    /// Checks every cross reference and the repository graph.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] listing repeated repository or
    /// component ids, then every dangling reference, then the graph error
    /// when references are sound but dependencies cycle.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        let mut duplicates: Vec<String> = self
            .repositories
            .iter()
            .filter(|r| !seen.insert(r.id.as_str()))
            .map(|r| format!("repository '{}'", r.id))
            .collect();
        let mut seen = HashSet::new();
        duplicates.extend(
            self.components
                .iter()
                .filter(|c| !seen.insert(c.id.as_str()))
                .map(|c| format!("component '{}'", c.id)),
        );
        if !duplicates.is_empty() {
            return Err(ValidationError::new("Configuration declares duplicate ids")
                .with_items(duplicates));
        }

        let known: HashSet<&str> = self.repositories.iter().map(|r| r.id.as_str()).collect();
        let mut problems = Vec::new();
        let mut check = |id: &str, context: String| {
            if !known.contains(id) {
                problems.push(format!("{context} references unknown repository '{id}'"));
            }
        };

        for component in &self.components {
            for id in &component.repositories {
                check(id, format!("component '{}'", component.id));
            }
        }
        for step in &self.build_steps {
            check(&step.repository_id, format!("build step '{}'", step.name));
        }
        for id in self.image_builds.keys() {
            check(id, "image build".to_string());
        }
        for id in &self.build_order.order {
            check(id, "build order".to_string());
        }
        for (id, deps) in &self.build_order.dependencies {
            check(id, "dependency map".to_string());
            for dep in deps {
                check(dep, format!("dependencies of '{id}'"));
            }
        }

        if !problems.is_empty() {
            problems.sort();
            return Err(ValidationError::new("Configuration references unknown repositories")
                .with_items(problems));
        }

        self.repository_graph().validate()?;
        Ok(())
    }

    /// Returns the repository dependency graph.
    ///
    /// Nodes follow `build_order.order` first, then the remaining
    /// repositories in declaration order.
    #[must_use]
    pub fn repository_graph(&self) -> DependencyGraph {
        let mut nodes: Vec<String> = Vec::with_capacity(self.repositories.len());
        for id in &self.build_order.order {
            if self.repository(id).is_some() && !nodes.contains(id) {
                nodes.push(id.clone());
            }
        }
        for repo in &self.repositories {
            if !nodes.contains(&repo.id) {
                nodes.push(repo.id.clone());
            }
        }
        DependencyGraph::from_parts(nodes, self.build_order.dependencies.clone())
    }

    /// Resolves a component selection to repository ids in declaration
    /// order.
    ///
    /// An empty selection means every enabled component, or every
    /// repository when no components are defined.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] naming unknown component ids.
    pub fn select_repositories(&self, components: &[String]) -> Result<Vec<String>, ValidationError> {
        if components.is_empty() && self.components.is_empty() {
            return Ok(self.repositories.iter().map(|r| r.id.clone()).collect());
        }

        let unknown: Vec<String> = components
            .iter()
            .filter(|id| !self.components.iter().any(|c| &c.id == *id))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(ValidationError::new("Unknown components selected").with_items(unknown));
        }

        let selected: HashSet<&str> = self
            .components
            .iter()
            .filter(|c| {
                if components.is_empty() {
                    c.enabled
                } else {
                    components.contains(&c.id)
                }
            })
            .flat_map(|c| c.repositories.iter().map(String::as_str))
            .collect();

        Ok(self
            .repositories
            .iter()
            .filter(|r| selected.contains(r.id.as_str()))
            .map(|r| r.id.clone())
            .collect())
    }

    /// Returns the dependency graph restricted to `repositories`.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the restricted graph is invalid.
    pub fn build_graph(&self, repositories: &[String]) -> Result<DependencyGraph, ValidationError> {
        let keep: HashSet<String> = repositories.iter().cloned().collect();
        let graph = self.repository_graph().subgraph(&keep);
        graph.validate()?;
        Ok(graph)
    }
}

static IMAGE_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:docker\s+build|docker\s+buildx|podman\s+build)\b").expect("image pattern is valid")
});

static INSTALL_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:npm\s+(?:install|ci)|yarn\s+install|pnpm\s+install|pip3?\s+install|bundle\s+install|go\s+mod\s+download|cargo\s+fetch)\b",
    )
    .expect("install pattern is valid")
});

static BARE_YARN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[;&|]\s*)yarn\s*(?:$|[;&|]|-)").expect("yarn pattern is valid")
});

static BUILD_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:npm\s+run|yarn\s+build|pnpm\s+build|make|cargo\s+build|go\s+build|gradlew|gradle|mvn)\b",
    )
    .expect("build pattern is valid")
});

/// Infers a step kind from command text.
///
/// Image builds win over installs, installs over build tools; anything
/// unrecognised is a custom script.
#[must_use]
pub fn infer_step_kind(command: &str) -> StepKind {
    let command = command.trim().to_lowercase();
    if IMAGE_COMMAND.is_match(&command) {
        StepKind::ImageBuild
    } else if INSTALL_COMMAND.is_match(&command) || BARE_YARN.is_match(&command) {
        StepKind::DependencyInstall
    } else if BUILD_COMMAND.is_match(&command) {
        StepKind::BuildScript
    } else {
        StepKind::CustomScript
    }
}
