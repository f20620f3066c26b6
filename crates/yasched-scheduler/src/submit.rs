//! Task submission.
//!
//! Validation happens here, not at dispatch: a task against an unknown
//! engine, a broken spawn template, or with missing inputs is rejected
//! before anything reaches the database.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::info;

use yasched_core::EngineRepository;
use yasched_db::{DbError, TaskMetadata, TaskStore};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("unknown engine `{0}`")]
    UnknownEngine(String),

    #[error("engine `{engine}` spawn template has unknown placeholder(s): {placeholders}")]
    BadSpawnTemplate { engine: String, placeholders: String },

    #[error("missing input file `{0}`")]
    MissingInput(String),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Check a submission against the engine declarations.
pub fn validate_submission(
    engines: &EngineRepository,
    engine_name: &str,
    inputs: &BTreeMap<String, String>,
) -> Result<(), SubmitError> {
    let engine = engines
        .get(engine_name)
        .ok_or_else(|| SubmitError::UnknownEngine(engine_name.to_string()))?;

    let unknown = engine.unknown_spawn_placeholders();
    if !unknown.is_empty() {
        return Err(SubmitError::BadSpawnTemplate {
            engine: engine_name.to_string(),
            placeholders: unknown.join(", "),
        });
    }

    for required in &engine.input_files {
        if !inputs.contains_key(required) {
            return Err(SubmitError::MissingInput(required.clone()));
        }
    }
    Ok(())
}

/// Validate and insert a TO_DO task.
pub async fn submit_task(
    db: &TaskStore,
    engines: &EngineRepository,
    label: &str,
    engine_name: &str,
    inputs: BTreeMap<String, String>,
    webhook_url: Option<String>,
    ncpus: Option<u32>,
) -> Result<i32, SubmitError> {
    validate_submission(engines, engine_name, &inputs)?;
    let metadata = TaskMetadata {
        engine: engine_name.to_string(),
        inputs,
        webhook_url,
        ncpus,
        ..TaskMetadata::default()
    };
    let task_id = db.submit(label, &metadata).await?;
    info!(task_id, label, engine = engine_name, "task accepted");
    Ok(task_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use yasched_core::{DeploySource, Engine, ProcessCheck};

    fn engines(spawn: &str) -> EngineRepository {
        EngineRepository::new([Engine {
            name: "dummy".to_string(),
            platforms: vec!["debian-11".to_string()],
            platform_packages: vec![],
            deploy: DeploySource::LocalFiles {
                files: vec![PathBuf::from("dummyengine")],
            },
            spawn: spawn.to_string(),
            check: ProcessCheck::ProcessName {
                name: "dummyengine".to_string(),
            },
            sleep_interval: 1,
            input_files: vec!["1.input".to_string()],
            output_files: vec!["1.input.out".to_string()],
        }])
    }

    fn inputs() -> BTreeMap<String, String> {
        BTreeMap::from([("1.input".to_string(), "hello".to_string())])
    }

    #[test]
    fn valid_submission_passes() {
        let repo = engines("{engine_path}/dummyengine {task_path}/1.input");
        assert!(validate_submission(&repo, "dummy", &inputs()).is_ok());
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let repo = engines("{engine_path}/x");
        assert!(matches!(
            validate_submission(&repo, "ghost", &inputs()),
            Err(SubmitError::UnknownEngine(_))
        ));
    }

    #[test]
    fn broken_spawn_template_fails_at_submission() {
        // The engine parsed fine; the submission is what gets refused.
        let repo = engines("{nonsense} file");
        let err = validate_submission(&repo, "dummy", &inputs()).unwrap_err();
        match err {
            SubmitError::BadSpawnTemplate { placeholders, .. } => {
                assert_eq!(placeholders, "nonsense");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_declared_input_is_rejected() {
        let repo = engines("{engine_path}/x");
        let err = validate_submission(&repo, "dummy", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, SubmitError::MissingInput(name) if name == "1.input"));
    }

    #[test]
    fn extra_inputs_are_allowed() {
        let repo = engines("{engine_path}/x");
        let mut many = inputs();
        many.insert("extra.dat".to_string(), "x".to_string());
        assert!(validate_submission(&repo, "dummy", &many).is_ok());
    }
}
