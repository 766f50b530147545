use clap::Parser;
use std::io;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use trunkline::core::conflict::ExecutionStrategy;
use trunkline::core::output::OutputWriter;
use trunkline::error::{GuardedError, TrunklineError};
use trunkline::logging::{init_logging, parse_early_log_config};
use trunkline::models::{Args, Commands, LockCommand};
use trunkline::{Config, Coordinator, ExitCode};

type Output = OutputWriter<io::Stdout>;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let raw_args: Vec<String> = std::env::args().collect();
    let _log_guard = init_logging(parse_early_log_config(&raw_args));

    let args = Args::parse();
    let mut out = OutputWriter::new(io::stdout(), args.shared.output);

    match run(args, &mut out).await {
        Ok(code) => code,
        Err(e) => {
            let message = match &e {
                TrunklineError::Other(inner) => format!("{:#}", inner),
                other => other.to_string(),
            };
            error!(error = %message, "Command failed");
            let kind = e.kind().map(|k| k.as_str());
            if let Err(write_err) = out.write_error(&message, kind) {
                eprintln!("{}: {}", message, write_err);
            }
            ExitCode::from_error(&e).into()
        }
    }
}

fn io_error(e: io::Error) -> TrunklineError {
    TrunklineError::Other(e.into())
}

async fn run(args: Args, out: &mut Output) -> Result<std::process::ExitCode, TrunklineError> {
    if args.create_config {
        let path = Config::create_sample_config()?;
        println!("Sample configuration at {}", path.display());
        return Ok(ExitCode::Success.into());
    }

    let Some(command) = args.command else {
        return Err(TrunklineError::Other(anyhow::anyhow!(
            "No command given; see `trunkline --help`"
        )));
    };

    let settings = Config::load_from_file()?
        .merge(Config::load_from_env())
        .merge(Config::from_shared_args(&args.shared))
        .resolve()?;
    let coordinator = Coordinator::open(settings)?;

    let code = match command {
        Commands::Lock(LockCommand::Status { group }) => {
            let written = match group {
                Some(group) => out.write(&coordinator.get_lock_status(&group)?),
                None => out.write(coordinator.held_locks()?.as_slice()),
            };
            written.map_err(io_error)?;
            ExitCode::Success.into()
        }
        Commands::Lock(LockCommand::Run {
            group,
            timeout_secs,
            command,
        }) => run_locked(&coordinator, &group, timeout_secs, &command)?,
        Commands::Conflicts(conflicts) => {
            let report = coordinator.get_conflict_report(conflicts.declarations()?)?;
            out.write(&report).map_err(io_error)?;
            let code = match report.strategy {
                ExecutionStrategy::Serial | ExecutionStrategy::Abort => ExitCode::Conflict,
                _ => ExitCode::Success,
            };
            code.into()
        }
        Commands::Check { source, target } => {
            let verdict = coordinator.check_merge(&source, &target)?;
            out.write(&verdict).map_err(io_error)?;
            let code = if verdict.is_clean() {
                ExitCode::Success
            } else {
                ExitCode::Conflict
            };
            code.into()
        }
        Commands::Submit { source, target } => {
            let request = coordinator.submit_merge(&source, &target)?;
            out.write(&request).map_err(io_error)?;
            ExitCode::for_status(request.status).into()
        }
        Commands::Status => {
            out.write(coordinator.get_queue_status()?.as_slice())
                .map_err(io_error)?;
            ExitCode::Success.into()
        }
        Commands::Outcome { id } => {
            let request = coordinator.get_merge_outcome(&id)?;
            out.write(&request).map_err(io_error)?;
            ExitCode::for_status(request.status).into()
        }
        Commands::Resolve { id } => {
            out.write(&coordinator.resolve_manual(&id)?)
                .map_err(io_error)?;
            ExitCode::Success.into()
        }
        Commands::Process { max_steps } => {
            coordinator.recover()?;
            let summary = coordinator.process_queue(max_steps)?;
            out.write(&summary).map_err(io_error)?;
            ExitCode::Success.into()
        }
        Commands::Recover => {
            out.write(&coordinator.recover()?).map_err(io_error)?;
            ExitCode::Success.into()
        }
        Commands::Monitor { once: true } => {
            out.write(&coordinator.scan_locks()?).map_err(io_error)?;
            ExitCode::Success.into()
        }
        Commands::Monitor { once: false } => {
            let period = coordinator.settings().monitor_interval;
            let handle = Arc::new(coordinator.monitor()).start(period);
            info!("Monitoring locks; press Ctrl-C to stop");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            handle.stop().await;
            ExitCode::Success.into()
        }
    };
    Ok(code)
}

/// Runs an external command under a group's lock and passes its exit code through.
fn run_locked(
    coordinator: &Coordinator,
    group: &str,
    timeout_secs: Option<u64>,
    command: &[String],
) -> Result<std::process::ExitCode, TrunklineError> {
    let Some((program, rest)) = command.split_first() else {
        return Err(TrunklineError::Other(anyhow::anyhow!("No command to run")));
    };
    let result = coordinator.run_guarded(group, timeout_secs.map(Duration::from_secs), |handle| {
        info!(group, token = %handle.token, program = %program, "Running command under lock");
        Command::new(program).args(rest).status()
    });

    match result {
        Ok(status) => Ok(match status.code() {
            Some(code) => std::process::ExitCode::from(u8::try_from(code).unwrap_or(1)),
            None => ExitCode::GeneralError.into(),
        }),
        Err(GuardedError::Lock(e)) => Err(e.into()),
        Err(GuardedError::Operation(e)) => Err(TrunklineError::Other(
            anyhow::Error::new(e).context(format!("Failed to run {}", program)),
        )),
    }
}
