use herald_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    herald_observability::init();

    let config = AppConfig::from_env()?;
    herald_worker::run(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
    })
    .await
}
