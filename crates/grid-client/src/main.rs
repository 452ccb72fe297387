use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use grid_client::{GridClient, RunOptions, RunOutcome, SubmitTaskRequest};
use grid_core::executor::{BackendSettings, ExecutorRegistry, ECHO_BACKEND};
use grid_core::Priority;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "grid")]
#[command(about = "Compute grid client", long_about = None)]
struct Cli {
    /// Base URL of the grid dispatcher.
    #[arg(long, env = "GRID_URL", default_value = "http://127.0.0.1:9090", global = true)]
    url: String,

    /// Bearer token from a trusted identity provider.
    #[arg(long, env = "GRID_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a task and print its id.
    Submit(TaskArgs),

    /// Print the current result of a task.
    Status { task_id: String },

    /// Stream a task's results until it finishes.
    Watch { task_id: String },

    /// Cancel a queued or running task.
    Cancel { task_id: String },

    /// Print queue depth, active workers and circuit state.
    GridStatus,

    /// Submit, wait for the result, and fall back to local execution if the grid cannot deliver.
    Run {
        #[command(flatten)]
        task: TaskArgs,

        #[arg(long, default_value_t = 2_000)]
        probe_deadline_ms: u64,

        /// Skip the pre-flight status probe.
        #[arg(long)]
        no_probe: bool,

        #[arg(long, default_value_t = 5_000)]
        submit_deadline_ms: u64,

        #[arg(long, default_value_t = 10_000)]
        result_deadline_ms: u64,

        /// Local backend used on fallback.
        #[arg(long, default_value = ECHO_BACKEND)]
        local_backend: String,
    },
}

#[derive(Args, Debug)]
struct TaskArgs {
    /// Task payload as JSON.
    #[arg(long, value_parser = parse_json, default_value = "{}")]
    payload: Value,

    #[arg(long, default_value = "NORMAL")]
    priority: Priority,

    #[arg(long)]
    backend: Option<String>,

    #[arg(long)]
    task_id: Option<String>,
}

impl From<TaskArgs> for SubmitTaskRequest {
    fn from(args: TaskArgs) -> Self {
        SubmitTaskRequest {
            task_id: args.task_id,
            payload: args.payload,
            priority: args.priority,
            backend: args.backend,
        }
    }
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|err| format!("invalid JSON payload: {err}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = GridClient::new(&cli.url, cli.token).context("init grid client")?;

    match cli.command {
        Command::Submit(task) => print(&client.submit(&task.into()).await?),
        Command::Status { task_id } => print(&client.task(&task_id).await?),
        Command::Watch { task_id } => {
            let results = client.watch(&task_id).await?;
            futures_util::pin_mut!(results);
            while let Some(result) = results.next().await {
                print(&result?)?;
            }
            Ok(())
        }
        Command::Cancel { task_id } => print(&client.cancel(&task_id).await?),
        Command::GridStatus => print(&client.grid_status().await?),
        Command::Run {
            task,
            probe_deadline_ms,
            no_probe,
            submit_deadline_ms,
            result_deadline_ms,
            local_backend,
        } => {
            let local = ExecutorRegistry::builtin()
                .build(&BackendSettings::default())
                .resolve(&local_backend)
                .with_context(|| format!("local backend {local_backend:?} is not available"))?;
            let opts = RunOptions {
                probe_deadline: (!no_probe).then(|| Duration::from_millis(probe_deadline_ms)),
                submit_deadline: Duration::from_millis(submit_deadline_ms),
                result_deadline: Duration::from_millis(result_deadline_ms),
            };

            let outcome = client.run(task.into(), &opts, local.as_ref()).await?;
            if let RunOutcome::Local { reason, .. } = &outcome {
                eprintln!("grid: ran locally ({reason})");
            }
            print(&outcome.output())
        }
    }
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("encode output")?
    );
    Ok(())
}
