use crate::broker::Broker;
use amqpkit_client::{Client, ConnectionConfig, EventHandler};

/// Heartbeats are off unless the broker asks for them.
pub fn config() -> ConnectionConfig {
    ConnectionConfig {
        heartbeat: 0,
        ..Default::default()
    }
}

pub async fn connect(broker: &Broker) -> (Client, EventHandler) {
    connect_with(broker, config()).await
}

pub async fn connect_with(broker: &Broker, config: ConnectionConfig) -> (Client, EventHandler) {
    amqpkit_client::setup_logger();

    Client::connect_stream(broker.connect(), config).await.unwrap()
}
