use anyhow::Context;
use clap::Parser;
use cvmfsplugin::cli::Args;
use cvmfsplugin::driver::Driver;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(args.log_level.into())
                .from_env_lossy(),
        )
        .init();

    info!("Running CVMFS CSI plugin with {:?}", std::env::args().collect::<Vec<_>>());

    let driver = Driver::new(args.driver_opts(LevelFilter::current())).context("Failed to initialize the driver")?;
    driver.run().await.context("Failed to run the driver")?;

    Ok(())
}
