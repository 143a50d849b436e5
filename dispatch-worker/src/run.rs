//! Executes one model run end to end: scratch directory, subprocess
//! invocation, attachment collection, LaTeX rendering.
//!
//! Grounded in `original_source/npsgd/model_task.py`'s
//! `createWorkingDirectory`/`run`/`generatePDF`,
//! `standalone_task.py`'s `StandaloneTask::runModel`, and
//! `matlab_task.py`'s `MatlabTask::runModel`. Model code itself is a
//! data file (§3.1), so there is no per-model `runModel` override here;
//! instead the run convention is fixed by `RunKind`: a standalone binary
//! receives its parameters as a JSON file path argument, a Matlab script
//! receives them as assignments piped to its stdin.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use dispatch_common::parameters::Parameter;
use dispatch_common::registry::{ModelDefinition, RunKind};
use dispatch_common::task::Task;

use crate::error::RunError;

pub struct RunOutput {
    pub pdf: Vec<u8>,
    pub attachments: Vec<(String, Vec<u8>)>,
}

/// One scratch directory per run, named by a random id so concurrent
/// retries of the same task never collide.
pub fn create_working_directory(root: &Path) -> Result<PathBuf, RunError> {
    let dir = root.join(uuid::Uuid::new_v4().to_string());
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Resolve the declared schema against a task's stored values, so each
/// `Parameter` carries a concrete value for rendering.
fn resolved_parameters(
    task: &Task,
    declared: &[Parameter],
) -> Result<Vec<Parameter>, RunError> {
    declared
        .iter()
        .map(|param| {
            let value = task
                .parameter_values
                .get(&param.name)
                .cloned()
                .ok_or_else(|| RunError::MissingParameterValue(param.name.clone()))?;
            let serialized = dispatch_common::parameters::SerializedParameter {
                name: param.name.clone(),
                value,
            };
            Ok(param.deserialize(&serialized)?)
        })
        .collect()
}

fn matlab_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Bool(b) => if *b { "true".to_owned() } else { "false".to_owned() },
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{other}'"),
    }
}

fn run_standalone(binary: &str, working_dir: &Path, task: &Task) -> Result<(), RunError> {
    let params_path = working_dir.join("params.json");
    let params_json = serde_json::to_vec_pretty(&task.parameter_values)
        .expect("parameter map is always serializable");
    fs::write(&params_path, params_json)?;

    let status = Command::new(binary)
        .arg(&params_path)
        .current_dir(working_dir)
        .status()?;

    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(RunError::NonZeroExit(code)),
        None => Err(RunError::Terminated),
    }
}

fn run_matlab(binary: &str, working_dir: &Path, task: &Task) -> Result<(), RunError> {
    let assignments: String = task
        .parameter_values
        .iter()
        .map(|(name, value)| format!("{} = {};\n", name, matlab_literal(value)))
        .collect();
    let script = format!("{assignments}exit;\n");

    let mut child = Command::new(binary)
        .arg("-nodisplay")
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .spawn()?;

    child
        .stdin
        .take()
        .expect("stdin was piped")
        .write_all(script.as_bytes())?;

    let status = child.wait()?;
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(RunError::NonZeroExit(code)),
        None => Err(RunError::Terminated),
    }
}

fn collect_attachments(
    definition: &ModelDefinition,
    working_dir: &Path,
) -> Result<Vec<(String, Vec<u8>)>, RunError> {
    definition
        .attachments
        .iter()
        .map(|name| {
            let bytes = fs::read(working_dir.join(name))
                .map_err(|_| RunError::MissingAttachment(name.clone()))?;
            Ok((name.clone(), bytes))
        })
        .collect()
}

/// Substitutes `{email}` and `{parameters}` in a model's `body_template`.
/// Deliberately plain `str::replace`, not a template engine: the body is
/// the LaTeX the model author wrote, with one slot for the submitter's
/// address and one for the rendered parameter table.
fn render_body(definition: &ModelDefinition, task: &Task, parameters: &[Parameter]) -> String {
    let rows = parameters
        .iter()
        .map(|p| format!("{} & {} \\\\", p.name, p.as_latex()))
        .collect::<Vec<_>>()
        .join("\n");

    let table = format!(
        "\\begin{{centering}}\n\\begin{{tabular*}}{{6in}}{{@{{\\extracolsep{{\\fill}}}} l l l}}\n\
         \\textbf{{Name}} & \\textbf{{Description}} & \\textbf{{Value}} \\\\\n\\hline\n{rows}\n\
         \\end{{tabular*}}\n\\end{{centering}}"
    );

    definition
        .body_template
        .replace("{email}", &task.email_address)
        .replace("{parameters}", &table)
}

fn render_pdf(
    definition: &ModelDefinition,
    task: &Task,
    parameters: &[Parameter],
    working_dir: &Path,
    latex_path: &str,
    latex_num_runs: u32,
) -> Result<Vec<u8>, RunError> {
    let body = render_body(definition, task, parameters);
    let tex_path = working_dir.join("task.tex");
    let pdf_path = working_dir.join("task.pdf");
    fs::write(&tex_path, body)?;

    for run in 0..latex_num_runs.max(1) {
        let status = Command::new(latex_path)
            .arg("-halt-on-error")
            .arg(&tex_path)
            .current_dir(working_dir)
            .status()?;

        match status.code() {
            Some(0) => {}
            Some(code) => return Err(RunError::LatexFailed { run, status: code }),
            None => return Err(RunError::Terminated),
        }
    }

    Ok(fs::read(&pdf_path)?)
}

/// Runs a task's model to completion and returns the generated PDF plus
/// any declared auxiliary attachments. The caller owns cleanup of
/// `working_dir`.
pub fn execute(
    definition: &ModelDefinition,
    task: &Task,
    working_dir: &Path,
    latex_path: &str,
    latex_num_runs: u32,
) -> Result<RunOutput, RunError> {
    match definition.run.kind {
        RunKind::Standalone => run_standalone(&definition.run.binary, working_dir, task)?,
        RunKind::Matlab => run_matlab(&definition.run.binary, working_dir, task)?,
    }

    let parameters = resolved_parameters(task, &definition.parameters)?;
    let attachments = collect_attachments(definition, working_dir)?;
    let pdf = render_pdf(
        definition,
        task,
        &parameters,
        working_dir,
        latex_path,
        latex_num_runs,
    )?;

    Ok(RunOutput { pdf, attachments })
}
