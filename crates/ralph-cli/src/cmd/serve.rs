use anyhow::Context;
use ralph_core::config::Config;
use std::path::Path;

pub fn run(root: &Path, port: Option<u16>, open: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load .ralph/config.yaml")?;
    let port = port.unwrap_or(config.server.port);

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(ralph_server::serve(root.to_path_buf(), port, open))
}
