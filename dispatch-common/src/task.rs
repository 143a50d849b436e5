//! The task record that flows through confirmation, the pending queue, and
//! the in-flight set. Grounded in `model_task.py`'s `asDict`/`fromDict` wire
//! shape, generalized from one hardcoded model class to the `(name,
//! version)` pair used to look a task's model up in the registry.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::parameters::{Parameter, SerializedParameter};

pub type TaskId = u64;

const VISIBLE_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const VISIBLE_ID_LEN: usize = 8;

/// One model run, from submission through to delivery.
///
/// `task_id` is regenerated on every retry (see `retry`) so that a stale
/// worker's heartbeat or success report, carrying the old id, is silently
/// ignored rather than colliding with the task's new attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub visible_id: String,
    pub email_address: String,
    pub model_name: String,
    pub model_version: String,
    pub parameter_values: HashMap<String, serde_json::Value>,
    pub failure_count: u32,
}

/// Wire and persistence shape: `{emailAddress, taskId, visibleId,
/// failureCount, modelName, modelVersion, modelParameters: {<name>:
/// {name, value}}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDict {
    pub email_address: String,
    #[serde(default)]
    pub task_id: TaskId,
    #[serde(default)]
    pub visible_id: String,
    #[serde(default)]
    pub failure_count: u32,
    pub model_name: String,
    pub model_version: String,
    pub model_parameters: HashMap<String, SerializedParameter>,
}

impl Task {
    /// Build a task from a freshly-submitted form, validating each
    /// parameter against its declaration. `declared` is the model's
    /// parameter schema at the requested version.
    pub fn from_submission(
        dict: TaskDict,
        declared: &[Parameter],
    ) -> Result<Self, ValidationError> {
        let parameter_values = resolve_parameter_values(&dict, declared)?;

        Ok(Task {
            task_id: 0,
            visible_id: generate_visible_id(),
            email_address: dict.email_address,
            model_name: dict.model_name,
            model_version: dict.model_version,
            parameter_values,
            failure_count: 0,
        })
    }

    /// Reconstitute an already-created task from its wire dict, as the
    /// worker does with the dict returned by `/worker_work_task`.
    /// Unlike `from_submission`, the existing `task_id`/`visible_id`/
    /// `failure_count` are preserved rather than freshly generated.
    pub fn from_dict(dict: TaskDict, declared: &[Parameter]) -> Result<Self, ValidationError> {
        let parameter_values = resolve_parameter_values(&dict, declared)?;

        Ok(Task {
            task_id: dict.task_id,
            visible_id: dict.visible_id,
            email_address: dict.email_address,
            model_name: dict.model_name,
            model_version: dict.model_version,
            parameter_values,
            failure_count: dict.failure_count,
        })
    }

    pub fn to_dict(&self) -> TaskDict {
        let model_parameters = self
            .parameter_values
            .iter()
            .map(|(name, value)| {
                (
                    name.clone(),
                    SerializedParameter {
                        name: name.clone(),
                        value: value.clone(),
                    },
                )
            })
            .collect();

        TaskDict {
            email_address: self.email_address.clone(),
            task_id: self.task_id,
            visible_id: self.visible_id.clone(),
            failure_count: self.failure_count,
            model_name: self.model_name.clone(),
            model_version: self.model_version.clone(),
            model_parameters,
        }
    }

    /// Whether this task's model version is one the worker lists as
    /// supported.
    pub fn matches_any(&self, supported: &[(String, String)]) -> bool {
        supported
            .iter()
            .any(|(name, version)| *name == self.model_name && *version == self.model_version)
    }
}

fn resolve_parameter_values(
    dict: &TaskDict,
    declared: &[Parameter],
) -> Result<HashMap<String, serde_json::Value>, ValidationError> {
    let mut parameter_values = HashMap::with_capacity(declared.len());
    for param in declared {
        let resolved = match dict.model_parameters.get(&param.name) {
            Some(serialized) => param.deserialize(serialized)?,
            None => param.non_exist_value()?,
        };
        let serialized = resolved.serialize()?;
        parameter_values.insert(param.name.clone(), serialized.value);
    }
    Ok(parameter_values)
}

fn generate_visible_id() -> String {
    let mut rng = rand::thread_rng();
    (0..VISIBLE_ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..VISIBLE_ID_ALPHABET.len());
            VISIBLE_ID_ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::ParameterKind;

    fn schema() -> Vec<Parameter> {
        vec![
            Parameter::new(
                "nSamples",
                ParameterKind::Integer {
                    min: Some(1),
                    max: Some(100),
                    step: None,
                },
            ),
            Parameter::new("subscribe", ParameterKind::Boolean),
        ]
    }

    fn submission(params: HashMap<String, SerializedParameter>) -> TaskDict {
        TaskDict {
            email_address: "person@example.com".to_owned(),
            task_id: 0,
            visible_id: String::new(),
            failure_count: 0,
            model_name: "erosion".to_owned(),
            model_version: "abc123".to_owned(),
            model_parameters: params,
        }
    }

    #[test]
    fn from_submission_fills_missing_boolean_with_false() {
        let mut params = HashMap::new();
        params.insert(
            "nSamples".to_owned(),
            SerializedParameter {
                name: "nSamples".to_owned(),
                value: serde_json::json!(10),
            },
        );
        let task = Task::from_submission(submission(params), &schema()).unwrap();
        assert_eq!(task.parameter_values["subscribe"], serde_json::json!(false));
        assert_eq!(task.visible_id.len(), VISIBLE_ID_LEN);
    }

    #[test]
    fn from_submission_rejects_missing_required_parameter() {
        let params = HashMap::new();
        let err = Task::from_submission(submission(params), &schema()).unwrap_err();
        assert!(matches!(err, ValidationError::MissingValue { .. }));
    }

    #[test]
    fn visible_ids_are_not_trivially_predictable() {
        let a = generate_visible_id();
        let b = generate_visible_id();
        assert_ne!(a, b);
    }

    #[test]
    fn from_dict_preserves_existing_ids() {
        let mut params = HashMap::new();
        params.insert(
            "nSamples".to_owned(),
            SerializedParameter { name: "nSamples".to_owned(), value: serde_json::json!(10) },
        );
        let mut dict = submission(params);
        dict.task_id = 42;
        dict.visible_id = "preset01".to_owned();
        dict.failure_count = 2;

        let task = Task::from_dict(dict, &schema()).unwrap();
        assert_eq!(task.task_id, 42);
        assert_eq!(task.visible_id, "preset01");
        assert_eq!(task.failure_count, 2);
    }

    #[test]
    fn matches_any_checks_name_and_version_together() {
        let mut params = HashMap::new();
        params.insert(
            "nSamples".to_owned(),
            SerializedParameter {
                name: "nSamples".to_owned(),
                value: serde_json::json!(10),
            },
        );
        params.insert(
            "subscribe".to_owned(),
            SerializedParameter {
                name: "subscribe".to_owned(),
                value: serde_json::json!(true),
            },
        );
        let task = Task::from_submission(submission(params), &schema()).unwrap();

        assert!(task.matches_any(&[("erosion".to_owned(), "abc123".to_owned())]));
        assert!(!task.matches_any(&[("erosion".to_owned(), "def456".to_owned())]));
        assert!(!task.matches_any(&[("other".to_owned(), "abc123".to_owned())]));
    }
}
