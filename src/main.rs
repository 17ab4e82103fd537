//! Command-line front end: answer one workspace query, prompting on stdin
//! whenever a write action needs a human decision.
//!
//! Usage: `workspace-orchestrator [--json] <query...>`
//!
//! `WORKSPACE_ID` and `USER_ID` select the scope (defaults `default` / `local`).

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use workspace_orchestrator::agent_core::{
    ConfirmationManager, ConfirmationRequest, ConfirmationResponse, ConfirmationStatus,
    Orchestrator,
};
use workspace_orchestrator::config::{find_config_path, load_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut json_output = false;
    let mut words = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--json" => json_output = true,
            _ => words.push(arg),
        }
    }
    let query = words.join(" ");
    if query.trim().is_empty() {
        bail!("usage: workspace-orchestrator [--json] <query...>");
    }

    let log_path = workspace_orchestrator::init_tracing(&workspace_orchestrator::data_dir().join("logs"))
        .context("failed to initialize logging")?;

    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let config_path = find_config_path(&cwd)?;
    let config = load_config(&config_path)?;
    tracing::info!(config = %config_path.display(), log = %log_path.display(), "config loaded");

    let (orchestrator, requests) = Orchestrator::from_config_logging(&config)?;
    if let Some(confirmations) = orchestrator.confirmations() {
        tokio::spawn(prompt_loop(requests, confirmations.clone()));
    }

    let workspace_id = std::env::var("WORKSPACE_ID").unwrap_or_else(|_| "default".to_string());
    let user_id = std::env::var("USER_ID").unwrap_or_else(|_| "local".to_string());
    let result = orchestrator
        .handle_query(&query, &workspace_id, &user_id, &[])
        .await;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.final_answer);
    }
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

/// Ask on stdin for every confirmation request as it arrives.
///
/// Answers are `y [reason]` to approve or `n [reason]` to reject. A response
/// the manager refuses (e.g. a critical approval without a reason) leaves the
/// request pending, so the question is asked again.
async fn prompt_loop(
    mut requests: mpsc::UnboundedReceiver<ConfirmationRequest>,
    confirmations: Arc<ConfirmationManager>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(request) = requests.recv().await {
        loop {
            eprintln!("\n[{}] {}", request.max_severity(), request.title);
            eprintln!("  {}", request.description);
            eprintln!("  expires at {}. Approve? [y/n] (optional reason after the answer)", request.expires_at);

            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read confirmation answer");
                    return;
                }
            };
            let (answer, reason) = match line.trim().split_once(' ') {
                Some((answer, reason)) => (answer.to_lowercase(), Some(reason.trim().to_string())),
                None => (line.trim().to_lowercase(), None),
            };
            let response = match answer.as_str() {
                "y" | "yes" => {
                    let Some(option) = request.default_option.as_deref() else {
                        eprintln!("  request has no option to approve");
                        continue;
                    };
                    let response = ConfirmationResponse::approve(&request.request_id, option);
                    match &reason {
                        Some(reason) => response.with_reason(reason),
                        None => response,
                    }
                }
                "n" | "no" => ConfirmationResponse::reject(&request.request_id, reason.as_deref()),
                _ => {
                    eprintln!("  please answer y or n");
                    continue;
                }
            };

            match confirmations.respond(response) {
                Ok(()) => break,
                Err(e) => {
                    eprintln!("  {e}");
                    if confirmations.status(&request.request_id) != Some(ConfirmationStatus::Pending) {
                        break;
                    }
                }
            }
        }
    }
}
