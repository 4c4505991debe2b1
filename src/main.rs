//=====================================================
// File: main.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Operator CLI for the script engine
// Objective: Run script files as one batch under a configuration and check
//            configuration files before deployment
//=====================================================

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args as ClapArgs, Parser, Subcommand};
use sandscript::config::EngineConfig;
use sandscript::engine::{BatchRequest, ScriptEngine, ScriptUnit};
use sandscript::interpreter::Value;
use sandscript::logging;
use sandscript::outcome::ExecutionReport;
use sandscript::session::TrustLevel;

#[derive(Parser, Debug)]
#[command(name = "sandscript", about = "Sandboxed script runner")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run script files in order as one batch.
    Run(RunArgs),
    /// Validate an engine configuration file.
    CheckConfig(CheckConfigArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct RunArgs {
    /// Scripts to execute, in order.
    #[arg(required = true)]
    pub scripts: Vec<PathBuf>,

    /// Engine configuration (TOML).
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Request a privileged session.
    #[arg(long = "privileged")]
    pub privileged: bool,

    /// Caller identity checked against the admin list.
    #[arg(long = "identity", default_value = "cli")]
    pub identity: String,

    /// Extra admin identity, on top of the configured ones.
    #[arg(long = "admin")]
    pub admins: Vec<String>,

    /// Override the sandboxed deadline.
    #[arg(long = "timeout-ms")]
    pub timeout_ms: Option<u64>,

    /// Bind a global, `name=value`; the value is read as JSON or else as text.
    #[arg(long = "bind", value_parser = parse_binding)]
    pub bindings: Vec<(String, Value)>,

    /// Print the full report as JSON.
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct CheckConfigArgs {
    pub path: PathBuf,
}

fn main() -> Result<()> {
    logging::init("sandscript");
    let args = Args::parse();

    match args.command {
        Command::Run(cmd) => run_entry(cmd),
        Command::CheckConfig(cmd) => check_config(cmd),
    }
}

fn run_entry(args: RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.security.admins.extend(args.admins.iter().cloned());

    let engine = ScriptEngine::from_config(config).context("starting script engine")?;

    let trust = if args.privileged {
        TrustLevel::Privileged
    } else {
        TrustLevel::Sandboxed
    };
    let mut request = BatchRequest::new(args.identity.as_str(), trust);
    if let Some(ms) = args.timeout_ms {
        request = request.with_deadline(Duration::from_millis(ms));
    }
    for (name, value) in args.bindings {
        request = request.bind(name, value);
    }
    for path in &args.scripts {
        let source = fs::read_to_string(path)
            .with_context(|| format!("reading script {}", path.display()))?;
        request = request.unit(ScriptUnit::new(path.display().to_string(), source).with_trust(trust));
    }

    let report = engine.submit_script_batch_report(request);
    print_report(&report, args.json)?;
    engine.shutdown();

    if report.outcome.is_success() {
        Ok(())
    } else {
        Err(anyhow!("batch ended with {}", report.outcome.kind()))
    }
}

fn print_report(report: &ExecutionReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{}", report.outcome.describe());
    println!(
        "ops: {}  loops: {}  elapsed: {:?}",
        report.usage.total_ops, report.usage.total_loops, report.elapsed
    );
    for (entry, count) in &report.usage.per_entry {
        println!("  {entry}: {count}");
    }
    Ok(())
}

fn check_config(args: CheckConfigArgs) -> Result<()> {
    let config = EngineConfig::load(&args.path)?;
    let engine = ScriptEngine::from_config(config)
        .with_context(|| format!("validating {}", args.path.display()))?;
    println!(
        "{}: ok ({} whitelist entries, {} admins)",
        args.path.display(),
        engine.whitelist().len(),
        engine.config().security.admins.len()
    );
    engine.shutdown();
    Ok(())
}

fn parse_binding(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    if name.is_empty() {
        return Err("binding name is empty".to_string());
    }
    let value = serde_json::from_str(value)
        .map(Value::from_json)
        .unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

//=====================================================
// End of file
//=====================================================
