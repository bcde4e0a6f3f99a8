use amqpkit_client::{Client, ClientConfig};
use anyhow::Result;

/// Declares the topology of the configuration file given as the first argument.
#[tokio::main]
async fn main() -> Result<()> {
    amqpkit_client::setup_logger();

    let path = std::env::args().nth(1).unwrap_or_else(|| "demos/topology.toml".to_string());
    let config = ClientConfig::from_file(&path)?;

    let (client, _events) = Client::connect(&config.url).await?;

    for queue in client.ensure_topology(&config.exchanges, &config.queues).await? {
        println!("{queue} is ready");
    }

    client.close().await?;

    Ok(())
}
