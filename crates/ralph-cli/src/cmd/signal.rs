use super::open_store;
use crate::output::print_json;
use anyhow::Context;
use ralph_core::config::Config;
use ralph_core::signal::Signal;
use std::path::Path;

pub struct SignalArgs {
    pub story: String,
    pub action: String,
    pub message: Option<String>,
    pub pr_url: Option<String>,
    pub url: Option<String>,
    pub local: bool,
}

pub fn run(root: &Path, args: SignalArgs, json: bool) -> anyhow::Result<()> {
    // Validate before anything leaves the process.
    let signal = Signal::build(
        &args.action,
        args.story.clone(),
        args.message.clone(),
        args.pr_url.clone(),
    )?;

    let result = if args.local {
        let outcome = open_store(root)?.apply_signal(&signal)?;
        serde_json::json!({
            "ok": true,
            "action": signal.action(),
            "changed": outcome.changed,
            "story": outcome.story,
            "state": outcome.run_state,
        })
    } else {
        let url = match args.url.clone() {
            Some(url) => url,
            None => {
                let config = Config::load(root)?;
                format!("http://localhost:{}/api/signal", config.server.port)
            }
        };
        post(&url, &args)?
    };

    if json {
        return print_json(&result);
    }
    let changed = result["changed"].as_bool().unwrap_or(false);
    println!(
        "{} signalled for {}{}",
        signal.action(),
        signal.story_id(),
        if changed { "" } else { " (no change)" }
    );
    Ok(())
}

fn post(url: &str, args: &SignalArgs) -> anyhow::Result<serde_json::Value> {
    let body = serde_json::json!({
        "storyId": args.story,
        "action": args.action,
        "message": args.message,
        "prUrl": args.pr_url,
    })
    .to_string();

    tracing::debug!(url, "posting signal");
    match ureq::post(url)
        .set("Content-Type", "application/json")
        .send_string(&body)
    {
        Ok(resp) => {
            let text = resp.into_string().context("failed to read signal response")?;
            serde_json::from_str(&text).context("signal response was not JSON")
        }
        Err(ureq::Error::Status(code, resp)) => {
            let text = resp.into_string().unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_string))
                .unwrap_or(text);
            anyhow::bail!("signal rejected ({code}): {message}")
        }
        Err(e) => Err(e).with_context(|| format!("failed to reach {url}")),
    }
}
