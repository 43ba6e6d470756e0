//! Conductor CLI - bring expert models up, route queries to them, tear them down

mod cli;

use anyhow::{bail, Context};
use clap::Parser;
use futures::StreamExt;
use std::io::Write;
use tracing_subscriber::EnvFilter;

use cli::{BringUp, Cli, Commands};
use conductor_core::{Answer, AnswerMode, Orchestrator, OrchestratorConfig, PollPolicy};
use conductor_runtime::default_registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = OrchestratorConfig::from_path(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    let registry = default_registry();
    let mut orchestrator =
        Orchestrator::from_config(&config, &registry).context("Failed to build backends")?;

    match cli.command {
        Commands::Validate => {
            println!(
                "Config OK: router {} and {} expert(s)",
                orchestrator.router().instance_name(),
                orchestrator.num_experts()
            );
        }

        Commands::Up(timing) => {
            bring_up(&mut orchestrator, timing).await?;
            println!("All servers ready");
        }

        Commands::Status => {
            let mut all_ready = true;
            for status in orchestrator.statuses().await? {
                all_ready &= status.readiness.ready;
                match &status.expert_id {
                    Some(id) => println!("expert {id}\t{}\t{}", status.instance, status.readiness),
                    None => println!("router\t{}\t{}", status.instance, status.readiness),
                }
            }
            if !all_ready {
                bail!("Not every server is ready");
            }
        }

        Commands::Ask {
            query,
            stream,
            bring_up: timing,
        } => {
            bring_up(&mut orchestrator, timing).await?;
            let mode = if stream {
                AnswerMode::Streaming
            } else {
                AnswerMode::Buffered
            };
            let answer = orchestrator.answer(&query, mode).await?;
            print_answer(answer).await?;
        }

        Commands::Smoke {
            query,
            bring_up: timing,
        } => {
            let result = smoke(&mut orchestrator, &query, timing).await;
            orchestrator
                .decommission_all()
                .await
                .context("Failed to decommission after smoke test")?;
            result?;
        }

        Commands::Down => {
            orchestrator.decommission_all().await?;
            println!("All servers decommissioned");
        }
    }

    Ok(())
}

/// Provision, activate, then poll until every backend is ready.
///
/// Pending provisioning and activation are retried every poll interval.
async fn bring_up(orchestrator: &mut Orchestrator, timing: BringUp) -> anyhow::Result<()> {
    let mut policy = PollPolicy::every(timing.poll_interval);
    if let Some(deadline) = timing.ready_timeout {
        policy = policy.with_deadline(deadline);
    }

    orchestrator
        .provision_until_complete(policy)
        .await
        .context("Resources did not finish initializing")?;
    orchestrator
        .activate_until_complete(timing.max_wait, policy)
        .await
        .context("Servers could not be started")?;
    orchestrator
        .wait_until_ready(policy)
        .await
        .context("Servers did not become ready")
}

async fn smoke(orchestrator: &mut Orchestrator, query: &str, timing: BringUp) -> anyhow::Result<()> {
    bring_up(orchestrator, timing).await?;

    for id in orchestrator.expert_ids().to_vec() {
        let answer = orchestrator.dispatch("hello", &id, AnswerMode::Buffered).await?;
        println!("expert {id}: {}", answer.into_text().await);
    }

    let id = orchestrator.route(query).await;
    println!("router picked expert {id} for: {query}");
    let answer = orchestrator.dispatch(query, &id, AnswerMode::Streaming).await?;
    print_answer(answer).await
}

async fn print_answer(answer: Answer) -> anyhow::Result<()> {
    match answer {
        Answer::Complete(text) => println!("{text}"),
        Answer::Stream(mut fragments) => {
            let mut stdout = std::io::stdout();
            while let Some(fragment) = fragments.next().await {
                write!(stdout, "{fragment}")?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        }
    }
    Ok(())
}
