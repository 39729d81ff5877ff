//! `phasegate check`: admission check for hook integration.
//!
//! Input (stdin, when `--class` is absent) is a request object, optionally
//! wrapped as `{"tool_input": {...}}`:
//!
//! ```json
//! {"tool_input": {"subagent_type": "code-scout", "mode": "parallel", "prompt": "..."}}
//! ```
//!
//! The worker's class comes from `class` or, failing that, the registry.
//! Answers are `{"decision": "approve"}`, `{"decision": "approve", "warning": ...}`
//! (exit 0) or `{"decision": "block", "reason": ...}` (exit 2).
//!
//! `--event stop` asks whether the session may end with the task where it is,
//! and `--event session-start` recovers the state file and reports the phase.

use anyhow::{Context, Result};
use phasegate::admission::{Admission, AdmissionGate};
use phasegate::config::{ConfigOverrides, PipelineConfig};
use phasegate::errors::{PipelineError, exit_codes};
use phasegate::phase::Phase;
use phasegate::state::{PipelineState, StateStore};
use phasegate::worker::{CapabilityClass, InvocationMode, WorkerInvocationRequest, WorkerRegistry};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

use super::super::CheckEvent;

/// Worker input above this many bytes is approved with a warning.
const LARGE_INPUT_BYTES: usize = 2000;

#[derive(Debug, Deserialize)]
struct CheckRequest {
    #[serde(default, alias = "capability_class")]
    class: Option<String>,
    #[serde(default, alias = "worker_id", alias = "subagent_type")]
    worker: Option<String>,
    #[serde(default)]
    mode: InvocationMode,
    #[serde(default, alias = "prompt")]
    input_context: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CheckInput {
    Wrapped { tool_input: CheckRequest },
    Bare(CheckRequest),
}

#[derive(Debug, Serialize)]
struct Decision {
    decision: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

impl Decision {
    fn approve() -> Self {
        Self {
            decision: "approve",
            reason: None,
            warning: None,
        }
    }

    fn warn(warning: String) -> Self {
        Self {
            warning: Some(warning),
            ..Self::approve()
        }
    }

    fn block(reason: String) -> Self {
        Self {
            decision: "block",
            reason: Some(reason),
            warning: None,
        }
    }

    fn exit_code(&self) -> i32 {
        if self.decision == "block" {
            exit_codes::BLOCKED
        } else {
            exit_codes::SUCCESS
        }
    }
}

pub fn cmd_check(
    project_dir: &Path,
    event: CheckEvent,
    class: Option<&str>,
    worker: Option<&str>,
) -> Result<i32> {
    let config = PipelineConfig::load(project_dir, &ConfigOverrides::default())?;
    let store = StateStore::new(&config.state_dir);

    match event {
        CheckEvent::SessionStart => {
            let state = store.load_or_recover()?;
            let status = serde_json::json!({
                "status": "initialized",
                "phase": state.phase(),
                "task_id": state.task_id(),
            });
            println!("{status}");
            return Ok(exit_codes::SUCCESS);
        }
        CheckEvent::Stop => {
            let decision = stop_decision(&store.load_or_recover()?);
            println!("{}", serde_json::to_string(&decision)?);
            return Ok(decision.exit_code());
        }
        CheckEvent::Dispatch => {}
    }

    let input = match class {
        Some(class) => CheckRequest {
            class: Some(class.to_string()),
            worker: worker.map(String::from),
            mode: InvocationMode::Single,
            input_context: None,
        },
        None => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("Failed to read check request from stdin")?;
            parse_request(&raw, worker)?
        }
    };

    let registry = WorkerRegistry::load(&config.registry_file())?;
    let request = resolve(input, &registry)?;

    let gate = AdmissionGate::new(config.toml.admission_table()?);
    let state = store.load_or_recover()?;

    let decision = dispatch_decision(&gate, &state, &request);
    println!("{}", serde_json::to_string(&decision)?);
    Ok(decision.exit_code())
}

fn dispatch_decision(
    gate: &AdmissionGate,
    state: &PipelineState,
    request: &WorkerInvocationRequest,
) -> Decision {
    let phase = state.phase();
    if let Admission::Denied(reason) = gate.check(request, phase) {
        return Decision::block(format!("phase {phase}: {reason}"));
    }

    let mut warnings = Vec::new();
    if state.active_workers().contains(&request.worker_id) {
        warnings.push(format!(
            "worker '{}' is already active in {phase}; this dispatch repeats it",
            request.worker_id
        ));
    }
    let size = request.input_context.len();
    if size > LARGE_INPUT_BYTES {
        warnings.push(format!(
            "input for '{}' is {size} bytes; consider splitting the work",
            request.worker_id
        ));
    }

    if warnings.is_empty() {
        Decision::approve()
    } else {
        Decision::warn(warnings.join("; "))
    }
}

/// Whether the session may end with the task in its current phase.
fn stop_decision(state: &PipelineState) -> Decision {
    match state.phase() {
        Phase::Idle | Phase::Complete => Decision::approve(),
        Phase::Blocked => Decision::warn(format!(
            "task {} is BLOCKED; see .phasegate/escalations/ and run `phasegate reset`",
            state.task_id()
        )),
        phase => Decision::block(format!(
            "task {} is still in {phase}; finish review or run `phasegate reset`",
            state.task_id()
        )),
    }
}

fn parse_request(raw: &str, worker: Option<&str>) -> Result<CheckRequest> {
    let input: CheckInput = serde_json::from_str(raw.trim()).map_err(|e| {
        PipelineError::InvalidRequest(format!("check input is not a request object: {e}"))
    })?;
    let mut request = match input {
        CheckInput::Wrapped { tool_input } => tool_input,
        CheckInput::Bare(request) => request,
    };
    if request.worker.is_none() {
        request.worker = worker.map(String::from);
    }
    Ok(request)
}

fn resolve(input: CheckRequest, registry: &WorkerRegistry) -> Result<WorkerInvocationRequest> {
    let worker_id = input.worker.unwrap_or_else(|| "cli-check".to_string());
    let class: CapabilityClass = match (&input.class, registry.get(&worker_id)) {
        (Some(class), _) => class.parse().map_err(PipelineError::InvalidRequest)?,
        (None, Some(entry)) => entry.class,
        (None, None) => {
            return Err(PipelineError::InvalidRequest(format!(
                "no class given and worker '{worker_id}' is not registered"
            ))
            .into());
        }
    };
    Ok(
        WorkerInvocationRequest::new(worker_id, class, input.input_context.unwrap_or_default())
            .with_mode(input.mode),
    )
}
