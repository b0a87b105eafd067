use color_eyre::eyre::eyre;
use color_eyre::Result;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::FmtSubscriber;

use iotprobe::cli::registry::{
    CMD_CERT, CMD_CLIENT_ID, CMD_CONFIG, CMD_COUNT, CMD_KEY, CMD_MESSAGE, CMD_PORT,
    CMD_SIGNING_REGION, CMD_TOPIC, CMD_VERBOSITY,
};
use iotprobe::cli::{self, CommandRegistry, CommandSpec};
use iotprobe::mqtt::config::{ConnectionSettings, FileConfig};
use iotprobe::mqtt::connection::ConnectionBuilder;
use iotprobe::mqtt::link::{spawn_pump, Subscription};
use iotprobe::mqtt::session::{PubSession, SessionSettings};

#[tokio::main]
async fn main() -> Result<()> {
    let mut registry = build_registry();
    registry.parse();

    let verbosity = registry
        .text(CMD_VERBOSITY)
        .unwrap_or_else(|| "off".to_string());
    setup(&verbosity)?;

    let file_config = match registry.text(CMD_CONFIG) {
        Some(path) => Some(FileConfig::load(std::path::Path::new(&path))?),
        None => FileConfig::default_path().and_then(|path| FileConfig::load_if_present(&path)),
    };
    let settings = ConnectionSettings::resolve(&registry, file_config.as_ref())?;

    let count = registry.integer(CMD_COUNT).unwrap_or(10);
    let count = u64::try_from(count).map_err(|_| eyre!("count must not be negative: {count}"))?;
    let topic = registry.required_text(CMD_TOPIC);
    let message = registry.required_text(CMD_MESSAGE);

    info!(
        "Connecting to {} with client ID '{}'...",
        settings.endpoint, settings.client_id
    );
    let endpoint = settings.endpoint.clone();
    let (client, event_loop) = ConnectionBuilder::new(settings).build()?;

    let (link_tx, link_rx) = mpsc::channel(100);
    let subscriptions = vec![Subscription {
        topic: topic.clone(),
        qos: QoS::AtLeastOnce,
    }];
    let _pump = spawn_pump(client.clone(), event_loop, link_tx, subscriptions);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Ctrl-C received, cancelling the session");
            signal_cancel.cancel();
        }
    });

    let session = PubSession::create(
        client,
        link_rx,
        SessionSettings::new(topic, message, count),
        cancel,
    );
    let publishing = session.wait_connected().await?;
    let disconnecting = publishing.publish_all().await?;
    disconnecting.disconnect().await?;

    debug!("Session against {} finished", endpoint);
    Ok(())
}

fn build_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new(
        "pubsub",
        "Send and receive messages through an MQTT connection.",
    )
    .with_mqtt_commands()
    .with_topic_message_commands()
    .with_proxy_commands()
    .with_logging_commands();

    registry.register(CommandSpec::text(
        CMD_KEY,
        "<path>",
        "Path to your key in PEM format.",
    ));
    registry.register(CommandSpec::text(
        CMD_CERT,
        "<path>",
        "Path to your client certificate in PEM format.",
    ));
    registry.register(CommandSpec::integer(
        CMD_PORT,
        "<int>",
        "Connection port. AWS IoT supports 443 and 8883 (optional, default=auto).",
    ));
    registry.register(CommandSpec::text(
        CMD_SIGNING_REGION,
        "<str>",
        "Signing region for websocket connections (optional; selects websocket transport).",
    ));
    registry.register(
        CommandSpec::text(
            CMD_CLIENT_ID,
            "<str>",
            "Client ID to use for MQTT connection (optional, default='test-*').",
        )
        .default_value(default_client_id()),
    );
    registry.register(
        CommandSpec::integer(
            CMD_COUNT,
            "<int>",
            "The number of messages to send (optional, default='10').",
        )
        .default_value("10"),
    );
    registry.register(CommandSpec::text(
        CMD_CONFIG,
        "<path>",
        "Path to a TOML settings file seeding connection defaults (optional).",
    ));
    registry
}

fn default_client_id() -> String {
    format!("test-{:08x}", std::process::id())
}

fn setup(verbosity: &str) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    FmtSubscriber::builder()
        .with_max_level(cli::verbosity_filter(verbosity))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
    Ok(())
}
