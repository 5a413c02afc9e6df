use std::time::Duration;

use rumqttc::{AsyncClient, EventLoop, MqttOptions};

use crate::config::MqttConfig;
use crate::error::{Error, Result};

/// Capacity of the request channel between the client handle and the event loop.
pub const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Build MQTT options from the provided configuration.
///
/// rumqttc panics on an empty client id or a sub-second keep-alive, so both
/// are rejected here instead.
pub fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions> {
    if config.client_id.trim().is_empty() {
        return Err(Error::Config("MQTT client id must not be empty".to_string()));
    }
    if config.host.trim().is_empty() {
        return Err(Error::Config("MQTT host must not be empty".to_string()));
    }
    if config.keep_alive_secs == 0 {
        return Err(Error::Config(
            "MQTT keep_alive_secs must be >= 1".to_string(),
        ));
    }

    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);

    if let Some(username) = &config.username {
        let password = config.password.clone().unwrap_or_default();
        options.set_credentials(username, password);
    }

    Ok(options)
}

/// Create an MQTT client and its event loop.
///
/// No network traffic happens until the event loop is polled; the connection
/// (and every reconnection) is driven by the caller's poll loop.
pub fn connect(config: &MqttConfig) -> Result<(AsyncClient, EventLoop)> {
    let options = mqtt_options(config)?;

    tracing::info!(
        broker = %config.broker_addr(),
        client_id = %config.client_id,
        authenticated = config.username.is_some(),
        "Connecting to MQTT broker"
    );

    Ok(AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY))
}
