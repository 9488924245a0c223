//! Command execution.

use miette::IntoDiagnostic;
use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use toolstage_core::{
    Config, InvocationRequest, InvocationResult, PlatformResolver, ToolIdentity, ToolManager,
};
use tracing::{info, warn};

use crate::cli::{Cli, Commands};

/// Run the parsed command line.
pub async fn execute(cli: Cli) -> miette::Result<ExitCode> {
    let config = load_config(&cli)?;
    let resolver = match cli.platform {
        Some(platform) => PlatformResolver::fixed(platform),
        None => PlatformResolver::detect()?,
    };

    match cli.command {
        Commands::Platform => {
            emit(&resolver.platform().to_string())?;
        }
        Commands::List { json } => {
            let manager = ToolManager::with_resolver(&config, resolver)?;
            list(&manager, json).await?;
        }
        Commands::Stage {
            name,
            version,
            json,
        } => {
            let manager = ToolManager::with_resolver(&config, resolver)?;
            let tool = manager
                .resolve_and_stage(&ToolIdentity::new(name, &version)?)
                .await?;
            if json {
                emit(&serde_json::to_string_pretty(&tool).into_diagnostic()?)?;
            } else {
                emit(&tool.executable.display().to_string())?;
            }
        }
        Commands::Run {
            name,
            version,
            timeout,
            env,
            inherit_path,
            args,
        } => {
            let manager = ToolManager::with_resolver(&config, resolver)?;
            let tool = manager
                .resolve_and_stage(&ToolIdentity::new(name, &version)?)
                .await?;

            let mut request = InvocationRequest::new(args);
            request.env.extend(env);
            if inherit_path && let Ok(path) = std::env::var("PATH") {
                request.env.insert("PATH".to_string(), path);
            }
            request.timeout = timeout.map(Duration::from_secs);

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted, stopping tool");
                    on_interrupt.cancel();
                }
            });

            let result = manager.run_with_cancel(&tool, &request, &cancel).await?;
            return forward(&result);
        }
        Commands::Clean => {
            let scratch = config.scratch_dir()?;
            match tokio::fs::remove_dir_all(&scratch).await {
                Ok(()) => info!(?scratch, "Removed staged tools"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).into_diagnostic(),
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn load_config(cli: &Cli) -> miette::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(root) = &cli.tools_root {
        config.tools_root = Some(root.clone());
    }
    if let Some(dir) = &cli.scratch_dir {
        config.scratch_dir = Some(dir.clone());
    }
    Ok(config)
}

async fn list(manager: &ToolManager, json: bool) -> miette::Result<()> {
    let packages = manager.store().discover().await?;
    if json {
        let entries: Vec<_> = packages
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name(),
                    "version": p.version().to_string(),
                    "platform": p.platform.to_string(),
                    "archive": p.archive_path(),
                    "description": p.manifest.description,
                })
            })
            .collect();
        return emit(&serde_json::to_string_pretty(&entries).into_diagnostic()?);
    }
    for p in &packages {
        emit(&format!("{}\t{}\t{}", p.name(), p.version(), p.platform))?;
    }
    Ok(())
}

/// Write the tool's output and translate its exit code.
fn forward(result: &InvocationResult) -> miette::Result<ExitCode> {
    io::stdout()
        .lock()
        .write_all(result.stdout.as_bytes())
        .into_diagnostic()?;
    io::stderr()
        .lock()
        .write_all(result.stderr.as_bytes())
        .into_diagnostic()?;
    if result.is_truncated() {
        warn!("Tool output was truncated");
    }
    Ok(ExitCode::from(exit_status(result.exit_code)))
}

/// Process status for a tool exit code; signals and out-of-range codes map to 1.
fn exit_status(code: Option<i32>) -> u8 {
    code.and_then(|c| u8::try_from(c).ok()).unwrap_or(1)
}

fn emit(line: &str) -> miette::Result<()> {
    writeln!(io::stdout().lock(), "{line}").into_diagnostic()
}
