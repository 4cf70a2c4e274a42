use super::open_store;
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use ralph_core::handoff::Handoff;
use ralph_core::types::Agent;
use std::path::Path;

#[derive(Subcommand)]
pub enum HandoffSubcommand {
    /// Hand a story from one agent to the next
    Create {
        story: String,
        from: String,
        to: String,
        /// JSON object carried with the handoff
        #[arg(long)]
        payload: Option<String>,
    },
    /// Accept a pending handoff
    Accept {
        id: i64,
        /// JSON merged into the stored payload
        #[arg(long)]
        payload: Option<String>,
    },
    /// Reject a pending handoff
    Reject {
        id: i64,
        #[arg(required = true)]
        reason: Vec<String>,
        /// Send the work back to the agent that handed it off
        #[arg(long = "return")]
        send_back: bool,
    },
    /// Show a story's pipeline position and handoff history
    Show { story: String },
    /// Show the pending handoff addressed to an agent
    Pending { story: String, agent: String },
}

pub fn run(root: &Path, subcmd: HandoffSubcommand, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    match subcmd {
        HandoffSubcommand::Create {
            story,
            from,
            to,
            payload,
        } => {
            let from: Agent = from.parse()?;
            let to: Agent = to.parse()?;
            let payload = parse_payload(payload.as_deref())?.unwrap_or(serde_json::json!({}));
            let story = store.get_story(&story)?;
            let handoff = store.create_handoff(&story.id, from, to, payload)?;
            report(&handoff, "created", json)
        }
        HandoffSubcommand::Accept { id, payload } => {
            let handoff = store.accept_handoff(id, parse_payload(payload.as_deref())?)?;
            report(&handoff, "accepted", json)
        }
        HandoffSubcommand::Reject {
            id,
            reason,
            send_back,
        } => {
            let reason = reason.join(" ");
            if !send_back {
                let handoff = store.reject_handoff(id, &reason)?;
                return report(&handoff, "rejected", json);
            }
            let (rejected, returned) = store.reject_and_return(id, &reason, None)?;
            if json {
                return print_json(&serde_json::json!({
                    "handoff": rejected,
                    "returned": returned,
                }));
            }
            println!("Handoff {} rejected", rejected.id);
            println!(
                "Handoff {} created: {} -> {}",
                returned.id, returned.from_agent, returned.to_agent
            );
            Ok(())
        }
        HandoffSubcommand::Show { story } => {
            let story = store.get_story(&story)?;
            let state = store.handoff_state(&story.id)?;
            if json {
                return print_json(&state);
            }
            println!(
                "{}: {} ({})",
                state.story_id,
                state.current_agent,
                state.phase.as_str()
            );
            if state.handoffs.is_empty() {
                println!("No handoffs.");
                return Ok(());
            }
            let rows = state
                .handoffs
                .iter()
                .map(|h| {
                    vec![
                        h.id.to_string(),
                        h.from_agent.to_string(),
                        h.to_agent.to_string(),
                        h.status.to_string(),
                        h.rejection_reason.clone().unwrap_or_default(),
                    ]
                })
                .collect();
            print_table(&["ID", "FROM", "TO", "STATUS", "REASON"], rows);
            Ok(())
        }
        HandoffSubcommand::Pending { story, agent } => {
            let agent: Agent = agent.parse()?;
            let story = store.get_story(&story)?;
            let pending = store.pending_handoff(&story.id, agent)?;
            if json {
                return print_json(&serde_json::json!({ "handoff": pending }));
            }
            match pending {
                Some(h) => report(&h, "pending", false),
                None => {
                    println!("No pending handoff for {agent} on {}.", story.id);
                    Ok(())
                }
            }
        }
    }
}

fn parse_payload(raw: Option<&str>) -> anyhow::Result<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(s).context("--payload must be JSON"))
        .transpose()
}

fn report(handoff: &Handoff, verb: &str, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&serde_json::json!({ "handoff": handoff }));
    }
    println!(
        "Handoff {} {verb}: {} -> {} on {}",
        handoff.id, handoff.from_agent, handoff.to_agent, handoff.story_id
    );
    Ok(())
}
