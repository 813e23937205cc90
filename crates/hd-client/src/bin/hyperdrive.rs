use anyhow::Context;
use clap::{Parser, Subcommand};
use hd_client::{ControlPlane, Experiment, LogProgress, RestControlPlane, RunHandle, WaitOptions};
use hd_sweep::{JobDescription, SweepFile};
use hd_types::{HdError, MetricGoal, PrimaryMetric, RunId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser)]
#[command(
    name = "hyperdrive",
    about = "Submit and track hyperparameter sweeps",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a sweep file and print the job description it produces.
    ///
    /// Runs entirely offline.
    Validate {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(short, long, default_value = "sweep")]
        experiment: String,
    },
    /// Submit a sweep file to the control plane at $HYPERDRIVE_ENDPOINT
    Submit {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(short, long)]
        experiment: String,
        /// Block until the sweep finishes. Ctrl-C stops waiting, not the sweep.
        #[arg(long)]
        wait: bool,
        #[arg(long, default_value_t = 10)]
        poll_secs: u64,
        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Print the current state of a run
    Status {
        #[arg(short, long)]
        experiment: String,
        #[arg(short, long)]
        run_id: String,
    },
    /// Print the child run with the best primary-metric value
    Best {
        #[command(flatten)]
        run: MetricArgs,
    },
    /// Print every child run with its metrics, best first
    Metrics {
        #[command(flatten)]
        run: MetricArgs,
    },
}

#[derive(clap::Args)]
struct MetricArgs {
    #[arg(short, long)]
    experiment: String,
    #[arg(short, long)]
    run_id: String,
    /// Primary metric name
    #[arg(short, long)]
    metric: String,
    /// maximize or minimize
    #[arg(short, long, default_value = "maximize")]
    goal: String,
}

impl MetricArgs {
    fn attach(&self) -> anyhow::Result<RunHandle> {
        let goal: MetricGoal = self.goal.parse()?;
        Ok(RunHandle::attach(
            experiment(&self.experiment)?,
            RunId::new(self.run_id.as_str()),
            PrimaryMetric::new(self.metric.as_str(), goal)?,
        ))
    }
}

fn experiment(name: &str) -> anyhow::Result<Experiment> {
    let control_plane: Arc<dyn ControlPlane> =
        Arc::new(RestControlPlane::from_env().context("control plane configuration")?);
    Ok(Experiment::new(name, control_plane)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hyperdrive=info".parse()?)
                .add_directive("hd_client=info".parse()?)
                .add_directive("hd_sweep=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file, experiment } => {
            let config = SweepFile::load(&file)?.into_run_configuration()?;
            print_json(&JobDescription::new(experiment, &config))
        }
        Commands::Submit {
            file,
            experiment: name,
            wait,
            poll_secs,
            timeout_secs,
        } => {
            let config = SweepFile::load(&file)?.into_run_configuration()?;
            let handle = experiment(&name)?.submit(&config).await?;
            println!("{}", handle.id());
            if !wait {
                return Ok(());
            }

            let mut options = WaitOptions::new(Duration::from_secs(poll_secs))?;
            if let Some(secs) = timeout_secs {
                options = options.with_timeout(Duration::from_secs(secs));
            }
            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = cancel_tx.send(true);
                }
            });

            match handle.wait_with(&options, &LogProgress, Some(cancel_rx)).await {
                Ok(state) => {
                    println!("{state}");
                    Ok(())
                }
                Err(HdError::WaitCancelled { run_id }) => {
                    eprintln!("stopped waiting; run {run_id} is still active");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
        Commands::Status {
            experiment: name,
            run_id,
        } => {
            let state = experiment(&name)?
                .control_plane()
                .get_job_status(&RunId::new(run_id))
                .await?;
            println!("{state}");
            Ok(())
        }
        Commands::Best { run } => print_json(&run.attach()?.best_child_run().await?),
        Commands::Metrics { run } => print_json(
            &run.attach()?
                .list_child_runs_sorted_by_primary_metric()
                .await?,
        ),
    }
}
