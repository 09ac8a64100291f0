//! Job control API server: `appfactory serve`.

use anyhow::Result;
use console::style;

use appfactory::factory::config::FactoryConfig;
use appfactory::factory::server::{ServerConfig, start_server};

pub async fn cmd_serve(port: u16, dev: bool, no_deploy: bool) -> Result<()> {
    let config = FactoryConfig::from_env()?;
    for warning in &config.warnings {
        eprintln!("{} {}", style("warning:").yellow(), warning);
    }
    start_server(
        &config,
        ServerConfig {
            port,
            dev_mode: dev,
            no_deploy,
        },
    )
    .await
}
