use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

use crate::params::{parse_assignment, parse_params, Assignment, Literal};

#[derive(Parser, Debug)]
#[command(
    about = "Loads a Lua script through the lantern bridge and drives one call into it",
    version
)]
pub struct Args {
    /// Lua script evaluated before anything else
    pub script: PathBuf,

    /// JSON file with bridge options (chunk name, memory limit, libraries)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Assign a global before the call (repeatable)
    #[arg(long = "set", value_name = "NAME=VALUE", value_parser = parse_assignment)]
    pub assignments: Vec<Assignment>,

    /// Global function to call after loading the script
    #[arg(long, value_name = "FUNCTION")]
    pub call: Option<String>,

    /// Positional argument for --call (repeatable)
    #[arg(long = "arg", value_name = "VALUE")]
    pub args: Vec<String>,

    /// Flat JSON object pushed as the last argument of --call
    #[arg(long, value_name = "JSON")]
    pub params: Option<String>,

    /// Expression evaluated after the call
    #[arg(long, value_name = "EXPR")]
    pub eval: Option<String>,

    /// Path to write the run summary as JSON
    #[arg(long)]
    pub json_out: Option<PathBuf>,

    /// Print each bridge step as it runs
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug)]
pub struct RunRequest {
    pub script: PathBuf,
    pub config: Option<PathBuf>,
    pub assignments: Vec<Assignment>,
    pub call: Option<CallRequest>,
    pub eval: Option<String>,
    pub json_out: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug)]
pub struct CallRequest {
    pub function: String,
    pub args: Vec<Literal>,
    pub params: Option<BTreeMap<String, String>>,
}

pub fn parse() -> Result<RunRequest> {
    let args = Args::parse();
    args.into_request()
}

impl Args {
    pub fn into_request(self) -> Result<RunRequest> {
        let call = match self.call {
            Some(function) => Some(CallRequest {
                function,
                args: self.args.iter().map(|raw| Literal::parse(raw)).collect(),
                params: self.params.as_deref().map(parse_params).transpose()?,
            }),
            None => {
                if !self.args.is_empty() {
                    bail!("--arg requires --call");
                }
                if self.params.is_some() {
                    bail!("--params requires --call");
                }
                None
            }
        };

        Ok(RunRequest {
            script: self.script,
            config: self.config,
            assignments: self.assignments,
            call,
            eval: self.eval,
            json_out: self.json_out,
            verbose: self.verbose,
        })
    }
}
