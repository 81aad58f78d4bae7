use color_eyre::Result;
use mqtt_console::config::AppConfig;
use mqtt_console::console::Console;
use mqtt_console::runtime::SessionHandle;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load_or_default(config_path.as_deref())?;
    info!(
        "Broker {} as {} (MQTT {})",
        config.connection.broker_url, config.connection.client_id, config.connection.protocol
    );

    let session = SessionHandle::spawn_rumqtt();
    let console = Console::new(session, config);
    console.register_subscriptions().await?;

    let session = console.run().await?;
    let controller = session.shutdown().await?;
    info!("Session closed: {:?}", controller);
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .pretty()
        .init();
}
