use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use deploy_adapter::environment::{fallback_socket_urls, resolve_socket_url};
use deploy_adapter::paths::{log_report, render_report};
use deploy_adapter::process::DEFAULT_LOG_LINES;
use deploy_adapter::{
    detect, load_config, log_profile, AppError, AppRecord, DetectionInput, PathResolver,
    ProcessSupervisor, SystemRunner,
};

/// Deployment environment adapter: detect the runtime profile, resolve
/// writable directories and supervise Node applications.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "DEPLOY_ADAPTER_CONFIG")]
    config: Option<PathBuf>,

    /// Public hostname the application is served under
    #[arg(long, env = "DEPLOY_ADAPTER_HOSTNAME")]
    hostname: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the detected deployment profile
    Profile,
    /// Resolve (and create) the profile directories
    Paths {
        /// Only report existence and permissions, as a table
        #[arg(long)]
        table: bool,
    },
    /// Start an application
    Start(AppArgs),
    /// Stop an application
    Stop { name: String },
    /// Restart an application
    Restart(AppArgs),
    /// Stop an application and forget it
    Delete { name: String },
    /// Show one application's status
    Status { name: String },
    /// List supervised applications
    List,
    /// Show recent log output
    Logs {
        name: String,
        #[arg(short = 'n', long, default_value_t = DEFAULT_LOG_LINES)]
        lines: usize,
    },
    /// Show cpu, memory and uptime for one application
    Metrics { name: String },
}

#[derive(Args, Debug)]
struct AppArgs {
    name: String,

    /// Working directory, relative to the profile root
    #[arg(short, long)]
    path: PathBuf,

    /// Explicit start command, run through the shell
    #[arg(long = "cmd")]
    command: Option<String>,

    /// Value passed to the application as PORT
    #[arg(long)]
    port: Option<u16>,

    /// Prefer in-process supervision
    #[arg(long)]
    no_external_manager: bool,
}

impl From<AppArgs> for AppRecord {
    fn from(args: AppArgs) -> Self {
        Self {
            name: args.name,
            path: args.path,
            command: args.command,
            port: args.port,
            use_external_manager: !args.no_external_manager,
        }
    }
}

#[derive(Serialize)]
struct ProfileOutput<'a> {
    profile: &'a deploy_adapter::DeploymentProfile,
    socket_url: String,
    fallback_socket_urls: Vec<String>,
}

#[derive(Serialize)]
struct Done<'a> {
    ok: bool,
    app: &'a str,
}

fn print_json<T: Serialize>(value: &T) -> deploy_adapter::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> deploy_adapter::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let input = DetectionInput::from_process(cli.hostname);
    let profile = detect(&input, &config);
    log_profile(&profile, &input);

    let resolver = Arc::new(PathResolver::new(&profile, &config));
    let supervisor =
        ProcessSupervisor::new(Arc::new(SystemRunner), Arc::clone(&resolver), &config.supervisor);

    match cli.command {
        Command::Profile => print_json(&ProfileOutput {
            profile: &profile,
            socket_url: resolve_socket_url(&profile),
            fallback_socket_urls: fallback_socket_urls(&profile),
        }),
        Command::Paths { table } => {
            if table {
                let reports = resolver.diagnose();
                log_report(&reports);
                print!("{}", render_report(&reports));
                Ok(())
            } else {
                print_json(&resolver.resolve_all())
            }
        }
        Command::Start(args) => {
            let app = AppRecord::from(args);
            supervisor.start(&app).await?;
            print_json(&Done { ok: true, app: &app.name })
        }
        Command::Restart(args) => {
            let app = AppRecord::from(args);
            supervisor.restart(&app).await?;
            print_json(&Done { ok: true, app: &app.name })
        }
        Command::Stop { name } => {
            supervisor.stop(&name).await?;
            print_json(&Done { ok: true, app: &name })
        }
        Command::Delete { name } => {
            supervisor.delete(&name).await?;
            print_json(&Done { ok: true, app: &name })
        }
        Command::Status { name } => match supervisor.status(&name).await {
            Some(info) => print_json(&info),
            None => Err(AppError::app_not_found(&name)),
        },
        Command::List => print_json(&supervisor.list().await),
        Command::Logs { name, lines } => {
            print!("{}", supervisor.logs(&name, lines).await?);
            Ok(())
        }
        Command::Metrics { name } => match supervisor.metrics(&name).await {
            Some(metrics) => print_json(&metrics),
            None => Err(AppError::app_not_found(&name)),
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            match serde_json::to_string_pretty(&e) {
                Ok(json) => eprintln!("{json}"),
                Err(_) => eprintln!("{e}"),
            }
            ExitCode::FAILURE
        }
    }
}
