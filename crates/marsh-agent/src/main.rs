//! marsh-agent: worker process for marsh environments.
//!
//! Usage: `marsh-agent <ENV_NAME> [--bind ADDR] [--module-dir DIR] [--script-interpreter PROGRAM]`

use anyhow::Context;
use clap::Parser;
use marsh_agent::{
    builtin_module, ExecutorServer, LoaderChain, ManifestLoader, Registry, ScriptRunner,
    BUILTIN_MODULE, DEFAULT_INTERPRETER,
};
use marsh_protocol::handshake::endpoint_line;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "marsh-agent", version, about = "Executes calls for a marsh environment")]
struct Args {
    /// Name of the environment this worker serves.
    env_name: String,

    /// Address to listen on. Port 0 picks a free port.
    #[arg(long, default_value = "127.0.0.1:0")]
    bind: SocketAddr,

    /// Directory against which relative module and script paths resolve.
    #[arg(long)]
    module_dir: Option<PathBuf>,

    /// Program used to run script targets.
    #[arg(long, default_value = DEFAULT_INTERPRETER)]
    script_interpreter: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Stdout belongs to the host handshake and routed output; diagnostics
    // go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("marsh_agent=warn")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let mut manifests = ManifestLoader::new();
    let mut scripts = ScriptRunner::new(&args.script_interpreter);
    if let Some(dir) = &args.module_dir {
        manifests = manifests.with_base_dir(dir);
        scripts = scripts.with_base_dir(dir);
    }
    let loader = LoaderChain::new()
        .with(Registry::new().register(BUILTIN_MODULE, builtin_module()))
        .with(manifests);

    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    let addr = listener.local_addr()?;

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", endpoint_line(&addr))?;
        stdout.flush()?;
    }
    info!(env = %args.env_name, addr = %addr, "listening");

    let server = Arc::new(ExecutorServer::new(loader, scripts));
    let reason = server.serve(listener).await?;
    info!(env = %args.env_name, reason = ?reason, "worker stopping");
    Ok(())
}
