//! Builds a task dict out of raw HTML form fields, validating each
//! declared parameter against the model's schema via `Parameter::with_value`
//! -- the same entry point the source's form handler calls for each
//! submitted field (`ModelParameter.withValue`), generalized from one
//! hand-written handler per model to the one generic path every model's
//! declared schema drives here.

use std::collections::HashMap;

use dispatch_common::error::ValidationError;
use dispatch_common::registry::ModelDefinition;
use dispatch_common::task::TaskDict;

pub fn task_dict_from_form(
    definition: &ModelDefinition,
    email_address: String,
    fields: &HashMap<String, String>,
) -> Result<TaskDict, ValidationError> {
    let mut model_parameters = HashMap::with_capacity(definition.parameters.len());
    for param in &definition.parameters {
        let resolved = match fields.get(&param.name) {
            Some(raw) => param.with_value(raw)?,
            None => param.non_exist_value()?,
        };
        model_parameters.insert(param.name.clone(), resolved.serialize()?);
    }

    Ok(TaskDict {
        email_address,
        task_id: 0,
        visible_id: String::new(),
        failure_count: 0,
        model_name: definition.short_name.clone(),
        model_version: definition.version.clone(),
        model_parameters,
    })
}
