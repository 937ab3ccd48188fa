//! taskforge — main entry point.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use taskforge::breaker::CircuitBreakerRegistry;
use taskforge::config::Config;
use taskforge::dispatcher::Dispatcher;
use taskforge::gateway::ProviderGateway;
use taskforge::job::{JobStore, JobSubmission, JobType, MemoryStore, Project};
use taskforge::queue::MemoryBroker;
use taskforge::sandbox::{SandboxExecutor, SandboxLauncher};

#[derive(Parser, Debug)]
#[command(name = "taskforge")]
#[command(about = "Dispatch software-engineering jobs to sandboxed LLM agents")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run dispatcher workers until interrupted.
    Dispatcher,
    /// Submit a job and run it to completion (single-process mode).
    Submit {
        /// Job type: design, implement, review, test, deploy, monitor.
        #[arg(long, default_value = "implement")]
        job_type: JobType,
        /// Task description handed to the agent.
        #[arg(long)]
        task: String,
        /// Optional USD budget for the ad-hoc project.
        #[arg(long)]
        budget: Option<rust_decimal::Decimal>,
    },
    /// Inspect dead-letter envelopes.
    Dlq {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Re-drive a dead-lettered job.
    Redrive { job_id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("taskforge=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new());
    let breaker = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
    let gateway = Arc::new(ProviderGateway::from_config(&config.llm, breaker.clone())?);
    let executor = Arc::new(SandboxExecutor::new(config.sandbox.clone()));

    // Remove containers left behind by a previous run before taking work.
    match executor.reap_orphans().await {
        Ok(0) => {}
        Ok(reaped) => tracing::info!(reaped, "removed orphan sandbox containers"),
        Err(e) => tracing::warn!(error = %e, "orphan reaper failed (is Docker running?)"),
    }

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        broker,
        gateway,
        executor as Arc<dyn SandboxLauncher>,
        breaker,
        config.clone(),
    ));

    match args.command {
        Command::Dispatcher => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let mut workers = Vec::new();
            for worker in 0..config.dispatcher.workers {
                let dispatcher = dispatcher.clone();
                let shutdown = shutdown_rx.clone();
                workers.push(tokio::spawn(async move {
                    dispatcher.run_worker(worker, shutdown).await;
                }));
            }

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(true);
            for worker in workers {
                let _ = worker.await;
            }
        }
        Command::Submit {
            job_type,
            task,
            budget,
        } => {
            let project = Project {
                id: Uuid::new_v4(),
                name: "ad-hoc".to_string(),
                budget_allocated: budget,
            };
            store.insert_project(project.clone()).await?;

            let job_id = dispatcher
                .enqueue(JobSubmission {
                    project_id: project.id,
                    job_type,
                    payload: serde_json::json!({ "task": task }),
                    assigned_agent_id: None,
                    max_retries: None,
                })
                .await?;
            tracing::info!(%job_id, "submitted");

            // Drive the pipeline inline until the job settles.
            loop {
                dispatcher.pump_due().await?;
                dispatcher.tick().await?;
                let job = store.job(job_id).await?;
                if job.status.is_terminal() {
                    println!("status: {}", job.status);
                    if let Some(result) = &job.result {
                        println!("{}", serde_json::to_string_pretty(result)?);
                    }
                    if let Some(reason) = &job.failure_reason {
                        println!("failure_reason: {reason}");
                    }
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(
                    config.dispatcher.poll_interval_ms,
                ))
                .await;
            }
        }
        Command::Dlq { limit } => {
            for envelope in dispatcher.take_dead_letters(limit).await? {
                println!("{}", serde_json::to_string(&envelope)?);
            }
        }
        Command::Redrive { job_id } => {
            dispatcher.redrive(job_id).await?;
            println!("job {job_id} re-queued");
        }
    }

    Ok(())
}
