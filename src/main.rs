//! FlowRunner CLI Entry Point
//!
//! Runs a workflow of shell-command steps once through the execution engine.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! flowrunner workflow.yaml
//!
//! # With an engine configuration file
//! flowrunner workflow.yaml --config engine.yaml
//!
//! # Provide context values used by step conditions and placeholders
//! flowrunner workflow.yaml --set channel=stable --set fast_mode=true
//!
//! # Run the steps exactly as declared, without optimization
//! flowrunner workflow.yaml --strategy simple
//! ```

use std::env;
use std::process::ExitCode;
use std::time::Duration;

use colored::*;
use log::{error, info, warn};
use serde_json::Value;

use flowrunner::config::load_config;
use flowrunner::execution::timeline::{peak_parallelism, render_bars};
use flowrunner::workflow::parser::load_workflow;
use flowrunner::{
    AllocationStrategy, EngineConfig, ExecutionContext, ExecutionOptions, ExecutionResult, ExecutionStrategy,
    Priority, SequentialExecutionEngine, APP_NAME, VERSION,
};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Bar width of the timing chart.
const TIMELINE_WIDTH: usize = 40;

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: String,
    config_path: Option<String>,
    strategy: ExecutionStrategy,
    priority: Priority,
    resource_strategy: AllocationStrategy,
    timeout: Option<Duration>,
    retries: u32,
    context: Vec<(String, Value)>,
    no_cache: bool,
    json: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            config_path: None,
            strategy: ExecutionStrategy::Basic,
            priority: Priority::Normal,
            resource_strategy: AllocationStrategy::Fifo,
            timeout: None,
            retries: 0,
            context: Vec::new(),
            no_cache: false,
            json: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{}", format!("{} v{}", APP_NAME, VERSION).cyan().bold());
    println!("Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>            Path to workflow YAML file");
    println!();
    println!("Options:");
    println!("  --config PATH              Engine configuration YAML file");
    println!("  --strategy NAME            basic (optimize) or simple (default: basic)");
    println!("  --priority NAME            low, normal or high (default: normal)");
    println!("  --resource-strategy NAME   fifo, priority, fair_share or predictive");
    println!("  --timeout SECS             Overall execution deadline");
    println!("  --retries N                Re-run a failed execution up to N times");
    println!("  --set KEY=VALUE            Add a context value (repeatable)");
    println!("  --no-cache                 Skip the result cache");
    println!("  --json                     Print the full result as JSON");
    println!("  --verbose                  Enable debug logging");
    println!("  --help                     Show this help message");
    println!("  --version                  Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner pipeline.yaml");
    println!("  flowrunner pipeline.yaml --set channel=stable --timeout 600");
    println!("  flowrunner pipeline.yaml --config engine.yaml --strategy simple");
}

/// Returns the value following an option, advancing the cursor.
fn option_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", option))
}

/// Parses `KEY=VALUE`; values that are valid JSON keep their type.
fn parse_context_value(pair: &str) -> Result<(String, Value), String> {
    let (key, raw) = pair
        .split_once('=')
        .ok_or_else(|| format!("Expected KEY=VALUE, got: {}", pair))?;
    if key.trim().is_empty() {
        return Err(format!("Empty key in: {}", pair));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.trim().to_string(), value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => config.verbose = true,
            "--no-cache" => config.no_cache = true,
            "--json" => config.json = true,
            "--config" => {
                config.config_path = Some(option_value(args, &mut i, "--config")?.to_string());
            }
            "--strategy" => {
                config.strategy = option_value(args, &mut i, "--strategy")?.parse()?;
            }
            "--priority" => {
                config.priority = option_value(args, &mut i, "--priority")?.parse()?;
            }
            "--resource-strategy" => {
                config.resource_strategy = option_value(args, &mut i, "--resource-strategy")?.parse()?;
            }
            "--timeout" => {
                let value = option_value(args, &mut i, "--timeout")?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("Invalid timeout value: {}", value))?;
                config.timeout = Some(Duration::from_secs(secs));
            }
            "--retries" => {
                let value = option_value(args, &mut i, "--retries")?;
                config.retries = value
                    .parse()
                    .map_err(|_| format!("Invalid retries value: {}", value))?;
            }
            "--set" => {
                let pair = option_value(args, &mut i, "--set")?;
                config.context.push(parse_context_value(pair)?);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => config.workflow_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Prints a human-readable summary of an execution result.
fn print_summary(result: &ExecutionResult) {
    println!();
    println!("{}", "Execution Summary".bold());
    println!("  Execution:  {}", result.execution_id);
    println!("  Workflow:   {}@{}", result.workflow, result.version);

    let status = result.status.to_string();
    let status = if result.success { status.green().bold() } else { status.red().bold() };
    println!("  Status:     {}", status);
    println!("  Duration:   {} ms", result.duration_ms);
    if let Some(predicted) = result.predicted_duration_ms {
        println!("  Predicted:  {} ms", predicted);
    }
    if result.from_cache {
        println!("  Source:     {}", "cache".cyan());
    }
    if !result.applied_optimizations.is_empty() {
        println!("  Optimized:  {}", result.applied_optimizations.join(", "));
    }
    if result.attempts > 1 {
        println!("  Attempts:   {}", result.attempts);
    }

    if !result.step_results.is_empty() {
        println!();
        println!("{}", "Steps".bold());
        for record in &result.step_results {
            let mark = if record.success { "ok".green() } else { "failed".red() };
            println!(
                "  {:<6} {} ({} ms)",
                mark,
                record.name,
                record.duration_ms
            );
            if let Some(ref err) = record.error {
                println!("         {}", err.dimmed());
            }
        }
    }

    if result.timings.len() > 1 {
        println!();
        println!("{}", "Timeline".bold());
        for line in render_bars(&result.timings, result.duration_ms, TIMELINE_WIDTH) {
            println!("  {}", line);
        }
        let peak = peak_parallelism(&result.timings);
        if peak > 1 {
            println!("  {} steps ran at once", peak);
        }
    }

    if let Some(ref err) = result.error {
        println!();
        println!("{} {}", "Error:".red().bold(), err);
    }
    println!();
}

/// Main application entry point. Returns whether the workflow succeeded.
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    if !config.json {
        print_banner();
    }

    let engine_config = match config.config_path {
        Some(ref path) => load_config(path)?,
        None => EngineConfig::default(),
    };

    info!("Loading workflow: {}", config.workflow_path);
    let workflow = load_workflow(&config.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            config.workflow_path, e
        )
    })?;
    info!(
        "Workflow loaded: {} ({} steps)",
        workflow.id(),
        workflow.len()
    );

    let mut ctx = ExecutionContext::new();
    for (key, value) in config.context {
        ctx.set(key, value);
    }

    let mut options = ExecutionOptions::default()
        .with_strategy(config.strategy)
        .with_priority(config.priority)
        .with_resource_strategy(config.resource_strategy)
        .with_retries(config.retries);
    if let Some(timeout) = config.timeout {
        options = options.with_timeout(timeout);
    }
    if config.no_cache {
        options = options.without_cache();
    }

    let engine = SequentialExecutionEngine::new(engine_config)?;
    if let Err(e) = engine.start().await {
        warn!("Running without background monitoring: {}", e);
    }

    let result = engine.execute(workflow, ctx, options).await;
    engine.shutdown().await;

    if config.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    Ok(result.success)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
