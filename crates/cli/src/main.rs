// Recalculation engine CLI
//
// Design Decision: Tasks arrive as a JSON array (argument, file, or stdin) and results
// leave as JSON on stdout, so a backend service can shell out to the engine.
// Design Decision: Logs go to stderr to keep stdout parseable.
// Design Decision: Numeric flags override DispatcherConfig::from_env / PoolConfig::from_env,
// so the binary and the library read the same environment variables.

mod input;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use recalc_dispatch::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "recalc-engine")]
#[command(about = "Run a batch of balance recalculations against a stored procedure")]
#[command(version)]
pub struct Cli {
    /// Tasks as a JSON array; read from --input or stdin when omitted
    pub tasks: Option<String>,

    /// Read tasks from a file
    #[arg(long, short, conflicts_with = "tasks")]
    pub input: Option<PathBuf>,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Stored procedure to call, optionally schema-qualified
    #[arg(long, env = "RECALC_PROCEDURE", default_value = DEFAULT_PROCEDURE)]
    pub procedure: String,

    /// Maximum concurrent workers [env: RECALC_MAX_CONCURRENCY] [default: 10]
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Connection pool size [env: RECALC_POOL_SIZE] [default: the concurrency]
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// How long a task waits for a connection, in milliseconds
    /// [env: RECALC_ACQUIRE_TIMEOUT_MS] [default: 30000]
    #[arg(long)]
    pub acquire_timeout_ms: Option<u64>,

    /// Limit on a single procedure call, in milliseconds [env: RECALC_INVOKE_TIMEOUT_MS]
    #[arg(long)]
    pub invoke_timeout_ms: Option<u64>,

    /// Output format
    #[arg(long, short, value_enum, default_value_t = OutputFormat::Json)]
    pub output: OutputFormat,

    /// Use an in-memory procedure that accepts every task (no database)
    #[arg(long)]
    pub dry_run: bool,
}

// Flags override the library's environment-backed configuration
impl Cli {
    fn dispatcher_config(&self) -> DispatcherConfig {
        let mut config = DispatcherConfig::from_env();
        if let Some(max) = self.concurrency {
            config = config.with_max_concurrency(max);
        }
        if let Some(ms) = self.acquire_timeout_ms {
            config = config.with_acquire_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.invoke_timeout_ms {
            config = config.with_invoke_timeout(Duration::from_millis(ms));
        }
        config
    }

    fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::from_env();
        if let Some(size) = self.pool_size.or(self.concurrency) {
            config = config.with_max_size(size);
        }
        if let Some(ms) = self.acquire_timeout_ms {
            config = config.with_acquire_timeout(Duration::from_millis(ms));
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    let raw = input::read(cli.tasks.as_deref(), cli.input.as_deref())?;
    let tasks = input::parse_tasks(&raw)?;
    tracing::info!(tasks = tasks.len(), dry_run = cli.dry_run, "recalc-engine starting");

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let result = if cli.dry_run {
        run(
            InMemoryConnector::new(),
            InMemoryProcedure::new(),
            &cli,
            tasks,
            cancel,
        )
        .await?
    } else {
        run_database(&cli, tasks, cancel).await?
    };

    println!("{}", cli.output.render(&result)?);
    Ok(())
}

/// Log filter from `RUST_LOG`, then `LOG_LEVEL`, then a default
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("LOG_LEVEL").map(tracing_subscriber::EnvFilter::new))
        .unwrap_or_else(|_| "recalc_engine=info,recalc_dispatch=info".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling tasks not yet started");
            cancel.cancel();
        }
    });
}

async fn run<C, I>(
    connector: C,
    invoker: I,
    cli: &Cli,
    tasks: Vec<Task>,
    cancel: CancellationToken,
) -> Result<BatchResult>
where
    C: Connector,
    I: ProcedureInvoker<Connection = C::Connection>,
{
    let pool = ConnectionPool::new(connector, cli.pool_config());
    let dispatcher = Dispatcher::new(pool, invoker, cli.dispatcher_config());

    let result = dispatcher
        .run_batch_with_cancel(tasks, cancel)
        .await
        .context("batch rejected");
    dispatcher.shutdown().await;
    result
}

#[cfg(feature = "postgres")]
async fn run_database(cli: &Cli, tasks: Vec<Task>, cancel: CancellationToken) -> Result<BatchResult> {
    let url = cli
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set; pass --database-url or use --dry-run")?;
    let connector = PgConnector::from_url(url).context("invalid database URL")?;
    let invoker = PgProcedureInvoker::new(cli.procedure.as_str()).context("invalid procedure")?;

    run(connector, invoker, cli, tasks, cancel).await
}

#[cfg(not(feature = "postgres"))]
async fn run_database(
    _cli: &Cli,
    _tasks: Vec<Task>,
    _cancel: CancellationToken,
) -> Result<BatchResult> {
    anyhow::bail!("built without PostgreSQL support; use --dry-run")
}
