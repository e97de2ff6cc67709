//! Turns a step into the process it runs.

use super::{ChainConfig, Step};
use crate::collaborators::DockerImageBuilder;
use crate::core::StepKind;
use crate::errors::ValidationError;
use crate::process::ProcessSpec;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_INSTALL_COMMAND: &str = "npm install";
const DEFAULT_BUILD_COMMAND: &str = "npm run build";

/// Checks that the step has enough configuration to run.
pub(crate) fn check_runnable(step: &Step) -> Result<(), String> {
    match step.kind {
        StepKind::CustomScript if step.config.command.is_none() => {
            Err(format!("custom script step '{}' has no command", step.id))
        }
        StepKind::ImageBuild if step.config.command.is_none() && step.config.image.is_none() => {
            Err(format!(
                "image build step '{}' needs a command or an image descriptor",
                step.id
            ))
        }
        _ => Ok(()),
    }
}

/// Checks every step before anything runs.
pub(crate) fn check_all_runnable(steps: &[Step]) -> Result<(), ValidationError> {
    let problems: Vec<String> = steps.iter().filter_map(|s| check_runnable(s).err()).collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new("Steps are missing required configuration").with_items(problems))
    }
}

/// Builds the process spec for a step.
pub(crate) fn process_spec(step: &Step, config: &ChainConfig) -> Result<ProcessSpec, String> {
    check_runnable(step)?;

    let base = match (&step.config.command, step.kind) {
        (Some(command), _) => command.clone(),
        (None, StepKind::DependencyInstall) => DEFAULT_INSTALL_COMMAND.to_string(),
        (None, StepKind::BuildScript) => DEFAULT_BUILD_COMMAND.to_string(),
        (None, StepKind::ImageBuild) => match &step.config.image {
            Some(image) => image_build_command(image),
            None => return Err(format!("image build step '{}' has no image", step.id)),
        },
        (None, StepKind::CustomScript) => {
            return Err(format!("custom script step '{}' has no command", step.id))
        }
    };

    let command = if step.config.flags.is_empty() {
        base
    } else {
        format!("{base} {}", step.config.flags.join(" "))
    };

    let mut spec = ProcessSpec::new(command)
        .with_env(config.env.clone())
        .with_env(step.config.env.clone());

    if let Some(cwd) = resolve_working_dir(step.config.working_dir.as_deref(), config.working_directory.as_deref()) {
        spec = spec.with_cwd(cwd);
    }
    if let Some(timeout_ms) = step.config.timeout_ms.or(config.default_timeout_ms) {
        spec = spec.with_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(shell) = &step.config.shell {
        spec = spec.with_shell(shell.clone());
    }
    Ok(spec)
}

fn resolve_working_dir(step_dir: Option<&Path>, chain_dir: Option<&Path>) -> Option<PathBuf> {
    match (step_dir, chain_dir) {
        (Some(dir), Some(base)) if dir.is_relative() => Some(base.join(dir)),
        (Some(dir), _) => Some(dir.to_path_buf()),
        (None, base) => base.map(Path::to_path_buf),
    }
}

/// Derives `docker build` from an image descriptor.
pub(crate) fn image_build_command(image: &super::ImageSpec) -> String {
    DockerImageBuilder::new().build_command(&image.context, &image.image_name(), &image.build_options())
}

/// Quotes a word for `sh` when it contains anything outside a safe set.
pub(crate) fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
