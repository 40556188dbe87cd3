use std::path::Path;

use anyhow::Context;
use ap_core::config::Config;
use ap_core::state_store::StateStoreError;
use ap_core::types::TodoStatus;

/// Run the `status` subcommand: print the saved run, if any.
pub fn run(config: &Config, workspace: &Path, json: bool) -> anyhow::Result<()> {
    let store = super::state_store(config, workspace);
    let snapshot = match store.load() {
        Ok(snapshot) => snapshot,
        Err(StateStoreError::NotFound(_)) => {
            if json {
                println!("null");
            } else {
                println!("no saved run in {}", store.dir().display());
            }
            return Ok(());
        }
        Err(e) => return Err(e).context("failed to read saved run"),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let list = &snapshot.todo_list;
    let agent = &snapshot.agent_state;
    println!("intent:   {}", list.user_intent);
    println!("status:   {}", agent.status);
    if let Some(strategy) = agent.strategy {
        println!("strategy: {strategy}");
    }
    println!("saved:    {}", snapshot.saved_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    for todo in &list.todos {
        let mark = match todo.status {
            TodoStatus::Completed => "[x]",
            TodoStatus::InProgress => "[~]",
            TodoStatus::Failed => "[!]",
            TodoStatus::Cancelled => "[-]",
            TodoStatus::Pending => "[ ]",
        };
        println!("  {mark} {} ({}, p{})", todo.description, todo.kind, todo.priority);
    }
    println!();
    println!("{}", list.summary());
    Ok(())
}
