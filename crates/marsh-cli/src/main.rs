//! marsh: run one function or script inside a marsh environment.
//!
//! ```text
//! marsh call --env data --dep numpy==1.26 builtin add --args '[2, 3]'
//! marsh script --env data ./report.sh --verbose
//! ```
//!
//! Worker output is echoed to stderr as `[env:stream] line`; the JSON result
//! goes to stdout.

mod config;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use config::CliConfig;
use marsh_core::{
    CallOptions, DependencySpec, Environment, EnvironmentManager, LogRecord, LogSink, Target,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "marsh", version, about = "Run code inside isolated marsh environments")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Call a function of a module.
    Call {
        #[command(flatten)]
        env: EnvArgs,

        /// Module path (registry name or manifest file).
        module: String,

        /// Function name.
        function: String,

        /// Positional arguments as a JSON array.
        #[arg(long, default_value = "[]")]
        args: String,

        /// Keyword arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        kwargs: String,

        /// Call timeout in seconds.
        #[arg(long)]
        timeout: Option<f64>,
    },

    /// Run a script.
    Script {
        #[command(flatten)]
        env: EnvArgs,

        /// Script path.
        path: String,

        /// Script arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct EnvArgs {
    /// Environment name.
    #[arg(long = "env")]
    name: String,

    /// Dependency, as `name`, `name==version` or `channel::name==version`.
    #[arg(long = "dep")]
    deps: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the result
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("marsh_cli=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = CliConfig::from_env();
    tracing::debug!(?config, "Configuration loaded");
    config.validate_warn();

    let manager = config.manager()?;

    let outcome = tokio::select! {
        result = run(&manager, cli.command) => result,
        _ = signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };

    if let Err(e) = manager.shutdown_all().await {
        tracing::error!(error = %e, "Shutdown incomplete");
    }

    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn run(manager: &EnvironmentManager, command: Command) -> anyhow::Result<Value> {
    match command {
        Command::Call {
            env,
            module,
            function,
            args,
            kwargs,
            timeout,
        } => {
            let args: Vec<Value> =
                serde_json::from_str(&args).context("--args must be a JSON array")?;
            let kwargs: Map<String, Value> =
                serde_json::from_str(&kwargs).context("--kwargs must be a JSON object")?;
            let mut options = CallOptions::new();
            if let Some(secs) = timeout {
                let timeout = Duration::try_from_secs_f64(secs)
                    .context("--timeout must be a non-negative number of seconds")?;
                options = options.with_timeout(timeout);
            }

            let environment = open(manager, &env).await?;
            let value = environment
                .execute(Target::function(module, function), args, kwargs, options)
                .await?;
            Ok(value)
        }
        Command::Script { env, path, args } => {
            let args = args.into_iter().map(Value::String).collect();
            let environment = open(manager, &env).await?;
            Ok(environment.run_script(&path, args).await?)
        }
    }
}

/// Provision (or reuse) and launch the environment named on the command line.
async fn open(manager: &EnvironmentManager, args: &EnvArgs) -> anyhow::Result<Environment> {
    let spec = DependencySpec::parse(&args.deps).map_err(anyhow::Error::msg)?;
    let environment = manager
        .register_or_get(&args.name, &spec)
        .await
        .with_context(|| format!("failed to provision environment {}", args.name))?;

    let echo: Arc<dyn LogSink> = Arc::new(|record: &LogRecord| {
        eprintln!("[{}:{}] {}", record.env, record.source, record.line);
    });
    environment
        .launch(Some(echo))
        .await
        .with_context(|| format!("failed to launch environment {}", args.name))?;
    Ok(environment)
}
