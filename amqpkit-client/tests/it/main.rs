mod broker;
mod consume;
mod direct;
mod flow;
mod helper;
mod topic;
mod topology;

use amqpkit_client::*;

pub fn unwrap_delivered_message(signal: ConsumerSignal) -> DeliveredMessage {
    match signal {
        ConsumerSignal::Delivered(msg) => *msg,
        other => panic!("{other:?} is not a Deliver signal"),
    }
}

pub fn message_from_string(body: &str) -> PublishedMessage {
    use std::time::{SystemTime, UNIX_EPOCH};

    PublishedMessage::default().str(body).properties(MessageProperties {
        content_type: Some("plain/text".into()),
        content_encoding: Some("UTF-8".into()),
        message_id: Some(uuid::Uuid::new_v4().as_hyphenated().to_string()),
        timestamp: Some(SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()),
        user_id: Some("integration-test".into()),
        app_id: Some("amqpkit-client-test".into()),
        ..Default::default()
    })
}
