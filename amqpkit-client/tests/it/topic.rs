use crate::broker::Broker;
use crate::helper;
use amqpkit_client::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn topic_routing_by_binding_key() -> anyhow::Result<()> {
    let broker = Broker::start();
    let (client, _events) = helper::connect(&broker).await;

    let exchanges = [ExchangeDecl::new("test.topic", "topic")];
    let queues = [
        QueueDecl::new("bob.xxx").bind("test.topic", "xxx"),
        QueueDecl::new("bob.yyy").bind("test.topic", "yyy"),
        QueueDecl::new("bob.all").bind("test.topic", "#"),
    ];

    client.ensure_topology(&exchanges, &queues).await?;

    let xxx = Arc::new(Mutex::new(vec![]));
    let received = xxx.clone();

    let subscription = client
        .subscribe("bob.xxx", NoAck(false), move |message| {
            if let Some(m) = message {
                received.lock().unwrap().push(m.body_str().unwrap_or_default().to_string());
            }

            ConsumerAck::Ack
        })
        .await?;

    client.publish("test.topic", "xxx", "to xxx").await?;
    client.publish("test.topic", "yyy", "to yyy").await?;

    tokio::time::sleep(Duration::from_millis(100)).await;

    subscription.cancel().await?;

    assert_eq!(*xxx.lock().unwrap(), vec!["to xxx"]);
    assert_eq!(broker.queue_len("bob.yyy"), Some(1));
    assert_eq!(broker.queue_len("bob.all"), Some(2));
    assert_eq!(broker.queue_len("bob.xxx"), Some(0));

    client.close().await?;

    Ok(())
}

#[tokio::test]
async fn fanout_copies_to_every_queue() -> anyhow::Result<()> {
    let broker = Broker::start();
    let (client, _events) = helper::connect(&broker).await;

    let names = client
        .ensure_topology(
            &[ExchangeDecl::new("test.fanout", ExchangeType::Fanout)],
            &[
                QueueDecl::new("").exclusive(true).bind("test.fanout", ""),
                QueueDecl::new("").exclusive(true).bind("test.fanout", ""),
            ],
        )
        .await?;

    assert_eq!(names.len(), 2);
    assert_ne!(names[0], names[1]);

    client.publish("test.fanout", "", "everyone").await?;

    for name in &names {
        assert_eq!(broker.queue_len(name), Some(1));
    }

    client.close().await?;

    Ok(())
}
