use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use lantern_bridge::{Bridge, BridgeOptions, ScriptError, ScriptValue};
use log::info;
use serde::Serialize;

use crate::cli::{CallRequest, RunRequest};

/// What a run produced, in the shape written by `--json-out`.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub script: String,
    pub chunk_name: String,
    pub assignments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call: Option<CallSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval: Option<ScriptValue>,
}

#[derive(Debug, Serialize)]
pub struct CallSummary {
    pub function: String,
    pub arg_count: usize,
    pub result: ScriptValue,
}

pub fn run(request: &RunRequest) -> Result<RunSummary> {
    let options = load_options(request)?;
    let chunk_name = options.chunk_name.clone();
    let source = fs::read_to_string(&request.script)
        .with_context(|| format!("reading script {}", request.script.display()))?;

    let mut bridge = Bridge::new(options).context("creating Lua bridge")?;
    if request.verbose {
        println!("Loading {} as chunk {chunk_name}", request.script.display());
    }
    bridge
        .eval(source)
        .pop()
        .map_err(|err| bridge_failure(&bridge, err, "loading script"))?;

    let mut assignments = Vec::with_capacity(request.assignments.len());
    for assignment in &request.assignments {
        let value = ScriptValue::from(&assignment.value);
        let rendered = format!("{} = {value}", assignment.name);
        bridge.set(assignment.name.as_str()).push_value(value);
        if let Some(err) = bridge.error() {
            return Err(bridge_failure(&bridge, err, &format!("setting {}", assignment.name)));
        }
        if request.verbose {
            println!("Set {rendered}");
        }
        assignments.push(rendered);
    }

    let call = request
        .call
        .as_ref()
        .map(|call| run_call(&mut bridge, call, request.verbose))
        .transpose()?;

    let eval = match request.eval.as_deref() {
        Some(expr) => {
            let value = bridge
                .eval(expr)
                .pop_value()
                .map_err(|err| bridge_failure(&bridge, err, "evaluating --eval"))?;
            if request.verbose {
                println!("Evaluated {expr} => {value}");
            }
            Some(value)
        }
        None => None,
    };

    info!("run finished: {bridge:?}");
    Ok(RunSummary {
        script: request.script.display().to_string(),
        chunk_name,
        assignments,
        call,
        eval,
    })
}

fn load_options(request: &RunRequest) -> Result<BridgeOptions> {
    match request.config.as_deref() {
        Some(path) => BridgeOptions::from_json_file(path),
        None => Ok(BridgeOptions::default().with_chunk_name(chunk_name_for(&request.script))),
    }
}

fn chunk_name_for(script: &Path) -> String {
    script
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| lantern_bridge::DEFAULT_CHUNK_NAME.to_string())
}

fn run_call(bridge: &mut Bridge, call: &CallRequest, verbose: bool) -> Result<CallSummary> {
    bridge.call(call.function.as_str());
    for arg in &call.args {
        bridge.push_value(ScriptValue::from(arg));
    }
    if let Some(params) = &call.params {
        bridge.push_table(params);
    }
    let arg_count = call.args.len() + usize::from(call.params.is_some());
    let result = bridge
        .pop_value()
        .map_err(|err| bridge_failure(bridge, err, &format!("calling {}", call.function)))?;
    if verbose {
        println!("Called {} with {arg_count} argument(s) => {result}", call.function);
    }
    Ok(CallSummary {
        function: call.function.clone(),
        arg_count,
        result,
    })
}

/// Wraps a bridge error with the diagnostic or fatal notice that explains it.
fn bridge_failure(bridge: &Bridge, err: ScriptError, action: &str) -> anyhow::Error {
    let detail = match err {
        ScriptError::Fatal => bridge.take_fatal(),
        ScriptError::CallFailed | ScriptError::EvalFailed => {
            bridge.last_diagnostic().map(|diagnostic| diagnostic.to_string())
        }
        _ => None,
    };
    let error = anyhow!(err);
    let error = match detail {
        Some(detail) => error.context(detail),
        None => error,
    };
    error.context(action.to_string())
}

pub fn print_summary(summary: &RunSummary) {
    if let Some(call) = &summary.call {
        println!("{} => {}", call.function, call.result);
    }
    if let Some(value) = &summary.eval {
        println!("eval => {value}");
    }
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("serializing run summary to JSON")?;
    fs::write(path, json)
        .with_context(|| format!("writing run summary to {}", path.display()))?;
    Ok(())
}
