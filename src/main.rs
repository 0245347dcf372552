/// Mechaflow: embeddable business-process workflow engine
///
/// Main entry point. Loads configuration from `MECHAFLOW_*` environment
/// variables, deploys definitions from the configured directory and runs the
/// job scheduler until ctrl-c.

use mechaflow::{config::Config, start_service};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::default();

    start_service(config).await?;

    Ok(())
}
