//! Workflow Parser
//!
//! Loads workflow definitions whose steps are shell commands from YAML.
//! Each step entry carries the usual step metadata plus a `command`.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: release
//! version: "1.2"
//! working_dir: /srv/build
//! steps:
//!   - name: fetch
//!     type: setup
//!     command: git fetch --all
//!
//!   - name: unit_tests
//!     type: testing
//!     command: cargo test --lib
//!     depends_on: fetch
//!     parallelizable: true
//!     resources:
//!       memory_mb: 512
//!       cpu: 2.0
//!
//!   - name: publish
//!     type: deployment
//!     command: ./publish.sh {channel}
//!     depends_on: [unit_tests]
//!     side_effects: true
//!     conditions:
//!       - op: equals
//!         key: channel
//!         value: stable
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::Deserialize;

use super::model::{Step, StepMetadata, Workflow};
use super::step::CommandExecutor;
use super::validator::{check_references, check_unique_names};
use crate::error::{EngineError, Result};

#[derive(Deserialize, Debug)]
struct WorkflowDefinition {
    name: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    steps: Vec<StepDefinition>,
}

#[derive(Deserialize, Debug)]
struct StepDefinition {
    command: String,
    #[serde(flatten)]
    metadata: StepMetadata,
}

fn default_version() -> String {
    "1".to_string()
}

/// Parses a workflow definition from a YAML string.
///
/// Relative `working_dir` values are resolved against `base_dir` when given.
pub fn parse_workflow(yaml: &str, base_dir: Option<&Path>) -> Result<Workflow> {
    let definition: WorkflowDefinition = serde_yaml::from_str(yaml)?;

    if definition.name.trim().is_empty() {
        return Err(EngineError::Workflow("workflow has no name".to_string()));
    }
    if definition.steps.is_empty() {
        return Err(EngineError::Workflow(format!(
            "workflow '{}' has no steps",
            definition.name
        )));
    }

    let working_dir = definition.working_dir.map(|dir| match base_dir {
        Some(base) if dir.is_relative() => base.join(dir),
        _ => dir,
    });

    let mut steps = Vec::with_capacity(definition.steps.len());
    for step_def in definition.steps {
        let metadata = step_def.metadata;
        if metadata.is_synthetic() {
            return Err(EngineError::Workflow(format!(
                "step '{}' may not declare a synthetic kind",
                metadata.name
            )));
        }
        if step_def.command.trim().is_empty() {
            return Err(EngineError::Workflow(format!(
                "step '{}' has no command specified",
                metadata.name
            )));
        }

        let mut executor = CommandExecutor::new(step_def.command.trim());
        if let Some(dir) = &working_dir {
            executor = executor.with_working_dir(dir.clone());
        }

        debug!("Parsed step '{}' ({})", metadata.name, metadata.step_type);
        steps.push(Step::from_parts(metadata, Arc::new(executor)));
    }

    check_unique_names(&steps)?;
    check_references(&steps)?;

    info!(
        "Parsed workflow '{}' v{} with {} steps",
        definition.name,
        definition.version,
        steps.len()
    );

    Ok(Workflow::from_steps(definition.name, definition.version, steps))
}

/// Loads a workflow from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("pipeline.yaml")?;
///     println!("Loaded {} steps", workflow.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        EngineError::Workflow(format!(
            "failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());
    parse_workflow(&yaml_content, path.parent())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepType;
    use tempfile::tempdir;

    const PIPELINE: &str = r#"
name: release
version: "1.2"
steps:
  - name: fetch
    type: setup
    command: echo fetch
  - name: test
    type: testing
    command: echo test
    depends_on: fetch
    parallelizable: true
    resources:
      memory_mb: 512
      cpu: 2.0
  - name: publish
    type: deployment
    command: echo {channel}
    depends_on: [test]
    side_effects: true
    conditions:
      - op: equals
        key: channel
        value: stable
"#;

    #[test]
    fn test_parse_workflow() {
        let workflow = parse_workflow(PIPELINE, None).unwrap();
        assert_eq!(workflow.id(), "release@1.2");
        assert_eq!(workflow.len(), 3);

        let test = workflow.get_step("test").unwrap();
        assert_eq!(test.step_type(), StepType::Testing);
        assert!(test.metadata().parallelizable);
        assert_eq!(test.metadata().resources.memory_mb, 512);
        assert!(test.dependencies().contains("fetch"));

        let publish = workflow.get_step("publish").unwrap();
        assert!(publish.metadata().side_effects);
        assert_eq!(publish.metadata().conditions.len(), 1);
    }

    #[test]
    fn test_default_version() {
        let yaml = "name: tiny\nsteps:\n  - name: only\n    command: echo hi\n";
        let workflow = parse_workflow(yaml, None).unwrap();
        assert_eq!(workflow.version(), "1");
    }

    #[test]
    fn test_empty_command_rejected() {
        let yaml = "name: w\nsteps:\n  - name: blank\n    command: '  '\n";
        assert!(matches!(parse_workflow(yaml, None), Err(EngineError::Workflow(_))));
    }

    #[test]
    fn test_no_steps_rejected() {
        let yaml = "name: w\nsteps: []\n";
        assert!(parse_workflow(yaml, None).is_err());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let yaml = "name: w\nsteps:\n  - name: a\n    command: echo\n    depends_on: ghost\n";
        assert!(matches!(
            parse_workflow(yaml, None),
            Err(EngineError::DependencyViolation { .. })
        ));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let yaml = "name: w\nsteps:\n  - name: a\n    command: echo\n  - name: a\n    command: echo\n";
        assert!(parse_workflow(yaml, None).is_err());
    }

    #[test]
    fn test_synthetic_kind_rejected() {
        let yaml = "name: w\nsteps:\n  - name: a\n    command: echo\n    synthetic: parallel\n";
        assert!(parse_workflow(yaml, None).is_err());
    }

    #[test]
    fn test_load_workflow_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        fs::write(&path, PIPELINE).unwrap();

        let workflow = load_workflow(&path).unwrap();
        assert_eq!(workflow.name(), "release");
    }

    #[test]
    fn test_load_workflow_missing_file() {
        let result = load_workflow("/nonexistent/pipeline.yaml");
        assert!(matches!(result, Err(EngineError::Workflow(_))));
    }
}
