// Doors client: headless page host that keeps a sync stream open and logs delivered actions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use doors_client::{config, logging, Engine, HttpTransport, Page, Transport};
use doors_core::{Call, HookId, Outcome, PageState, Payload};
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "doors-client", version, about = "Headless Doors page host")]
struct Cli {
    /// Config file (default: ~/.config/doors/client.toml, then /etc/doors/client.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Server origin, overrides config and env.
    #[arg(long)]
    base_url: Option<String>,
    /// Instance id to attach to.
    #[arg(long)]
    instance: Option<String>,
}

/// Logs every action and answers null.
struct LogPage {
    terminal: watch::Sender<bool>,
}

impl Page for LogPage {
    fn execute(&mut self, call: &Call, payload: &Payload) -> Outcome {
        info!(action = %call.action, arg = %call.arg, payload = ?payload, "action");
        Ok(Value::Null)
    }

    fn indicator_start(&mut self, hook: HookId, _indicator: &Value) {
        info!(%hook, "hook pending");
    }

    fn indicator_end(&mut self, hook: HookId) {
        info!(%hook, "hook settled");
    }

    fn reload(&mut self) {
        info!("page reload requested");
        let _ = self.terminal.send(true);
    }

    fn on_terminal(&mut self, state: PageState) {
        info!(?state, "page stopped");
        let _ = self.terminal.send(true);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging();

    let mut cfg = config::load(cli.config.as_deref()).context("load config")?;
    if let Some(base_url) = cli.base_url {
        cfg.base_url = base_url;
    }
    if let Some(instance) = cli.instance {
        cfg.instance = instance;
    }
    anyhow::ensure!(!cfg.instance.is_empty(), "no instance id (use --instance or DOORS_INSTANCE)");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(cfg.clone())?);
        let (terminal_tx, mut terminal_rx) = watch::channel(false);
        let page = LogPage { terminal: terminal_tx };
        info!(url = %cfg.sync_url(), "connecting");
        let (engine, task) = Engine::spawn(cfg, transport, Box::new(page));
        engine.ready();
        tokio::select! {
            r = shutdown_signal() => r?,
            _ = terminal_rx.wait_for(|done| *done) => {}
        }
        engine.shutdown();
        task.await.context("engine task")?;
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
