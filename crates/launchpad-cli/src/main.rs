use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use launchpad_core::{ConfigRegistry, HostIdentity, LaunchpadConfig, Platform, PlatformRegistry};
use launchpad_install::{InstallOptions, Installer};
use launchpad_remote::ProcessRunner;
use launchpad_submit::subshell::{eval_host, eval_platform};
use tracing::{info, warn};

mod submit;

#[derive(Parser, Debug)]
#[command(
    name = "launchpad",
    version,
    about = "Submit workflow task jobs to execution platforms"
)]
struct Cli {
    /// Config file (default: $LAUNCHPAD_CONFIG, then ~/.launchpad/launchpad.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit jobs for the tasks listed in a JSON file.
    Submit {
        /// JSON array of `{name, point, runtime, overrides}`.
        #[arg(long)]
        tasks: PathBuf,
    },
    /// Install a workflow from its source directory.
    Install {
        /// Defaults to the current directory.
        #[arg(long)]
        source: Option<PathBuf>,
        #[arg(long)]
        flow_name: Option<String>,
        #[arg(long, conflicts_with = "no_run_name")]
        run_name: Option<String>,
        #[arg(long)]
        no_run_name: bool,
        /// Point an installed workflow at a different source.
        #[arg(long)]
        redirect: bool,
    },
    /// Print the configured platforms and platform groups.
    Platforms,
    /// Evaluate a host or platform expression as the resolver would.
    Eval {
        #[arg(long, conflicts_with = "platform", required_unless_present = "platform")]
        host: Option<String>,
        #[arg(long)]
        platform: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "launchpad=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // explicit --config > LAUNCHPAD_CONFIG env > ~/.launchpad/launchpad.toml
    let config_path = cli.config.or_else(|| std::env::var("LAUNCHPAD_CONFIG").ok());
    let config = LaunchpadConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        LaunchpadConfig::default()
    });

    let runner = Arc::new(ProcessRunner::new(
        config.submit.max_concurrent_commands,
        Duration::from_secs(config.submit.command_timeout_secs),
    ));

    match cli.command {
        Command::Submit { tasks } => submit::run(&config, runner, &tasks).await,
        Command::Install {
            source,
            flow_name,
            run_name,
            no_run_name,
            redirect,
        } => {
            let source = match source {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            let opts = InstallOptions {
                source,
                flow_name,
                run_name,
                no_run_name,
                redirect,
            };
            let installer = Installer::new(
                &config.workflow.run_root,
                config.install.exclude.clone(),
                runner.as_ref(),
            );
            let report = installer.install(&opts).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Platforms => {
            let registry = ConfigRegistry::from_config(&config);
            let platforms: Vec<&Platform> =
                registry.platforms().iter().map(|p| p.as_ref()).collect();
            let listing = serde_json::json!({
                "platforms": platforms,
                "platform_groups": registry.groups(),
            });
            println!("{}", serde_json::to_string_pretty(&listing)?);
            Ok(())
        }
        Command::Eval { host, platform } => {
            let timeout = Duration::from_secs(config.submit.eval_timeout_secs);
            if let Some(expr) = host {
                let identity = HostIdentity::detect(&config.host);
                let host = eval_host(&expr, runner.as_ref(), &identity, timeout).await?;
                println!("{host}");
            } else if let Some(expr) = platform {
                let name = eval_platform(&expr, runner.as_ref(), timeout).await?;
                let registry = ConfigRegistry::from_config(&config);
                let platforms = registry.lookup(&name)?;
                info!(expr = %expr, name = %name, count = platforms.len(), "platform resolved");
                let platforms: Vec<&Platform> = platforms.iter().map(|p| p.as_ref()).collect();
                println!("{}", serde_json::to_string_pretty(&platforms)?);
            }
            Ok(())
        }
    }
}
