//! # Compass netsetup
//!
//! Bootstraps the deployment network of a Compass deployment host: reads the
//! network descriptor named by `$NETWORK` and converges the management
//! ports on the host's Open vSwitch bridge.
//!
//! ## Usage
//! ```bash
//! NETWORK=/etc/compass/network.yml compass-netsetup --role mgmt
//! NETWORK=/etc/compass/network.yml compass-netsetup --dry-run --json
//! ```

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};

use compass_network::{
    ActuationReport, AdvisoryLock, DescriptorLoader, HostNetworkActuator, InterruptFlag,
    NetSetupError, RolePlan, ShellRunner,
};

mod cli;
mod config;

use cli::Args;
use config::Config;

/// Exit code for an unusable tool configuration.
const EXIT_BAD_CONFIG: u8 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::resolve(args.config.as_deref()) {
        Ok((config, _)) => config.with_cli_overrides(&args),
        Err(e) => {
            eprintln!("compass-netsetup: {:#}", e);
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("compass-netsetup: invalid configuration: {:#}", e);
        return ExitCode::from(EXIT_BAD_CONFIG);
    }

    if let Err(e) = compass_common::init_logging(&config.logging) {
        eprintln!("compass-netsetup: {:#}", e);
        return ExitCode::from(EXIT_BAD_CONFIG);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
        bridge = %config.bridge,
        roles = ?config.roles,
        dry_run = args.dry_run,
        "Starting compass-netsetup"
    );

    match run(&config, &args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_failure(&e);
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

async fn run(config: &Config, args: &Args) -> compass_network::Result<()> {
    let loader = DescriptorLoader::new(config.descriptor_env.clone());
    let descriptor = loader.load()?;

    if args.dry_run {
        // Planning never runs commands, so no elevation or lock is needed
        let actuator = HostNetworkActuator::new(
            ShellRunner::unprivileged(config.command_timeout()),
            config.actuator_options(),
        );
        let plans = actuator.plan(&descriptor)?;
        print_plan(&plans, args.json);
        return Ok(());
    }

    let runner = ShellRunner::new(&config.elevation, config.command_timeout()).await?;
    if !runner.prefix().is_empty() {
        info!(prefix = %runner.prefix().join(" "), "Running host commands elevated");
    }
    let _lock = AdvisoryLock::acquire(&config.lock_file)?;

    let interrupt = InterruptFlag::new();
    let listener = interrupt.listen_for_signals();

    let actuator =
        HostNetworkActuator::new(runner, config.actuator_options()).with_interrupt(interrupt);
    let result = actuator.apply(&descriptor).await;
    listener.abort();

    let report = result?;
    for role in &report.missing_roles {
        warn!(role = %role, "Requested role has no interface mapping");
    }
    print_report(&report, args.json);

    info!(
        roles = report.roles.len(),
        elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
        "Network bootstrap complete"
    );
    Ok(())
}

fn print_plan(plans: &[RolePlan], json: bool) {
    if json {
        print_json(plans);
        return;
    }
    for plan in plans {
        println!(
            "# {} -> {} on {}",
            plan.target.role, plan.target.port, plan.target.bridge
        );
        for step in &plan.steps {
            for command in &step.commands {
                println!("{:<16} {}", step.step, command);
            }
        }
    }
}

fn print_report(report: &ActuationReport, json: bool) {
    if json {
        print_json(report);
        return;
    }
    for role in &report.roles {
        for step in &role.steps {
            println!(
                "{} {} {}",
                role.port,
                step.step,
                if step.changed { "changed" } else { "ok" }
            );
        }
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => error!(error = %e, "Failed to serialize output"),
    }
}

/// Write the failing step, command and stderr to standard error.
fn report_failure(err: &NetSetupError) {
    error!(error = %err, exit_code = err.exit_code(), "Network bootstrap failed");

    eprintln!("compass-netsetup: {}", err);
    if let NetSetupError::ActuationFailed { step, command, .. } = err {
        eprintln!("  step:    {}", step);
        eprintln!("  command: {:?}", command.argv);
        if let Some(stderr) = err.stderr().map(str::trim).filter(|s| !s.is_empty()) {
            eprintln!("  stderr:  {}", stderr);
        }
    }
}
