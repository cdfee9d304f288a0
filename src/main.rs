//! Line-oriented REPL over the chat commands.
//!
//! Lines starting with `/` are commands; anything else is sent to the
//! current session.

use anyhow::{anyhow, Context};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use careergraph::commands::{chat, session};
use careergraph::config::{find_config_path, load_config};
use careergraph::{build_state, data_dir, init_tracing, AppState};

const HELP: &str = "\
Commands:
  /new              start a new session
  /sessions         list saved sessions
  /resume <id>      continue a saved session
  /facts            show facts gathered in this session
  /delete <id>      delete a session
  /help             show this help
  /quit             exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = data_dir();
    let log_path = init_tracing(&data_dir).context("failed to initialize logging")?;

    let cwd = std::env::current_dir()?;
    let config_path = find_config_path(&cwd)?;
    let config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let state = build_state(&config, &data_dir).await?;

    let mut current = chat::start_session(&state).map_err(|e| anyhow!(e))?.session_id;
    println!("CareerGraph. Logs: {}", log_path.display());
    println!("Session {current}. Type /help for commands.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            match run_command(&state, &mut current, command).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    println!("error: {e}");
                    continue;
                }
            }
        }

        match chat::send_message(&state, &current, line).await {
            Ok(resp) => {
                println!("\n{}\n", resp.text);
                if resp.tool_executions > 0 || !resp.records.is_empty() {
                    println!(
                        "[{} queries, {} executed, {} facts]\n",
                        resp.records.len(),
                        resp.tool_executions,
                        resp.facts.len()
                    );
                }
            }
            Err(e) => println!("error: {e}"),
        }
    }

    tracing::info!("=== CareerGraph exiting ===");
    Ok(())
}

/// Run one `/command`. Returns `Ok(false)` to quit.
async fn run_command(state: &AppState, current: &mut String, command: &str) -> Result<bool, String> {
    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("quit") | Some("exit"), _) => return Ok(false),
        (Some("help"), _) => println!("{HELP}"),
        (Some("new"), _) => {
            *current = chat::start_session(state)?.session_id;
            println!("Session {current}.");
        }
        (Some("sessions"), _) => {
            for s in session::list_sessions(state)? {
                println!(
                    "{}  {}  {} turns  {} queries  {}",
                    s.session_id,
                    s.last_activity,
                    s.turn_count,
                    s.query_count,
                    s.preview.unwrap_or_default()
                );
            }
        }
        (Some("resume"), Some(id)) => {
            let view = session::load_session(state, id).await?;
            for turn in &view.turns {
                println!("{}: {}", turn.role.as_str(), turn.content);
            }
            *current = view.session_id;
            println!("Resumed {current}.");
        }
        (Some("facts"), _) => {
            let view = session::load_session(state, current).await?;
            if view.facts.is_empty() {
                println!("No facts yet.");
            }
            for f in view.facts {
                println!("({}) -[{}]-> ({})", f.subject, f.relation, f.object);
            }
        }
        (Some("delete"), Some(id)) => {
            session::delete_session(state, id)?;
            println!("Deleted {id}.");
            if id == current.as_str() {
                *current = chat::start_session(state)?.session_id;
                println!("Session {current}.");
            }
        }
        _ => println!("{HELP}"),
    }
    Ok(true)
}
