//! In-process pipeline commands: `bizimatch run`, `approve`, `cancel`, `status`.
//!
//! These share the server's database, so a run started here can be
//! approved over HTTP later and vice versa.

use anyhow::{Context, Result};
use console::style;
use tokio::sync::broadcast;

use bizimatch::config::BizimatchConfig;
use bizimatch::pipeline::events::RunEvent;
use bizimatch::pipeline::{
    ApprovalDecision, PipelineOrchestrator, PipelineRun, RunStatus, StageName,
};

fn orchestrator(config: &BizimatchConfig) -> Result<PipelineOrchestrator> {
    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }
    PipelineOrchestrator::from_config(&config.toml)
}

pub async fn cmd_run(config: &BizimatchConfig, prompt: &str, auto_approve: bool) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let rx = orchestrator.subscribe();
    let run_id = orchestrator.run(prompt, None).await?;
    println!("{} {}", style("Started run").bold(), style(&run_id).cyan());

    let run = follow(&orchestrator, rx, &run_id, auto_approve).await?;
    print_outcome(&run);
    Ok(())
}

pub async fn cmd_approve(
    config: &BizimatchConfig,
    run_id: &str,
    reject: bool,
    comment: Option<&str>,
) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let decision = if reject {
        ApprovalDecision::Reject
    } else {
        ApprovalDecision::Approve
    };
    let rx = orchestrator.subscribe();
    let run = orchestrator.approve(run_id, decision, comment).await?;
    println!("{} {} ({:?})", style("Recorded decision for").bold(), style(run_id).cyan(), decision);

    let run = if run.overall_status.is_terminal() {
        run
    } else {
        follow(&orchestrator, rx, run_id, false).await?
    };
    print_outcome(&run);
    Ok(())
}

pub async fn cmd_cancel(config: &BizimatchConfig, run_id: &str) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let run = orchestrator.cancel(run_id).await?;
    println!("{} {}", style("Cancelled").yellow().bold(), run.run_id);
    Ok(())
}

pub async fn cmd_status(config: &BizimatchConfig, run_id: Option<&str>) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    match run_id {
        Some(run_id) => {
            let run = orchestrator.get(run_id).await?;
            print_run(&run);
        }
        None => {
            let runs = orchestrator.list().await?;
            if runs.is_empty() {
                println!("No runs yet. Start one with `bizimatch run \"<prompt>\"`.");
            }
            for run in runs {
                println!(
                    "{}  {:<10} {:<18} {}",
                    style(&run.run_id).cyan(),
                    status_label(run.overall_status),
                    run.current_stage.as_str(),
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
    }
    Ok(())
}

/// Print events for `run_id` until it finishes or parks at the review gate.
async fn follow(
    orchestrator: &PipelineOrchestrator,
    mut rx: broadcast::Receiver<RunEvent>,
    run_id: &str,
    auto_approve: bool,
) -> Result<PipelineRun> {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if event.run_id() != run_id {
            continue;
        }
        match event {
            RunEvent::StageStarted { stage, attempt, .. } => {
                println!("  {} {} (attempt {})", style("→").dim(), stage, attempt);
            }
            RunEvent::StageFinished { stage, status, .. } => {
                println!("  {} {} {}", style("✓").green(), stage, style(status.as_str()).dim());
            }
            RunEvent::StageFailed {
                stage,
                error,
                will_retry,
                ..
            } => {
                let note = if will_retry { "retrying" } else { "giving up" };
                println!("  {} {}: {} ({})", style("✗").red(), stage, error, note);
            }
            RunEvent::RunPaused { .. } if auto_approve => {
                println!("  {} review gate", style("Auto-approved").dim());
                orchestrator
                    .approve(run_id, ApprovalDecision::Approve, Some("auto-approved"))
                    .await
                    .context("Failed to auto-approve review gate")?;
            }
            RunEvent::RunPaused { .. } => break,
            RunEvent::RunFinished { .. } => break,
            RunEvent::RunCreated { .. } | RunEvent::RunResumed { .. } => {}
        }
    }
    Ok(orchestrator.get(run_id).await?)
}

fn print_outcome(run: &PipelineRun) {
    println!();
    match run.overall_status {
        RunStatus::Succeeded => {
            println!("{}", style("Pipeline succeeded.").green().bold());
            if let Some(path) = run
                .latest_output(StageName::Deployment)
                .and_then(|out| out.get("path"))
                .and_then(|p| p.as_str())
            {
                println!("Artifacts: {}", path);
            }
        }
        RunStatus::Paused => {
            println!("{}", style("Waiting for review.").yellow().bold());
            println!("Approve with: bizimatch approve {}", run.run_id);
            println!("Reject with:  bizimatch approve {} --reject", run.run_id);
        }
        RunStatus::Failed => {
            let reason = run
                .history
                .last()
                .and_then(|r| r.error.as_deref())
                .unwrap_or("unknown error");
            println!("{} {}", style("Pipeline failed:").red().bold(), reason);
        }
        RunStatus::Cancelled => println!("{}", style("Pipeline cancelled.").yellow()),
        RunStatus::Running => println!("Run {} is still running.", run.run_id),
    }
}

fn print_run(run: &PipelineRun) {
    println!("{} {}", style("Run").bold(), style(&run.run_id).cyan());
    println!("  prompt:  {}", run.original_prompt);
    println!("  status:  {}", status_label(run.overall_status));
    println!("  stage:   {}", run.current_stage);
    println!("  created: {}", run.created_at.to_rfc3339());
    println!();
    for (stage, status) in run.stage_statuses() {
        println!("  {:<18} {}", stage.as_str(), status.as_str());
    }
}

fn status_label(status: RunStatus) -> console::StyledObject<&'static str> {
    let label = style(status.as_str());
    match status {
        RunStatus::Succeeded => label.green(),
        RunStatus::Failed => label.red(),
        RunStatus::Paused | RunStatus::Cancelled => label.yellow(),
        RunStatus::Running => label.cyan(),
    }
}
