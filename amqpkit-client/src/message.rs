use crate::model::ChannelNumber;
use amqpkit_codec::content;
use amqpkit_codec::frame::{self, ContentBodyFrame, ContentHeaderFrame, FieldTable};

/// A message sent to the server or received from the server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Content {
    pub channel: ChannelNumber,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Standard set of message properties
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    /// 1 - non-persistent, 2 - persistent
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

/// A delivered message.
///
/// With the `consumer_tag` and `delivery_tag` a client can send back acknowledgements to the
/// server, saying that the message was successfully arrived.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeliveredMessage {
    pub message: Content,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// A mandatory or immediate message returned to the client because it couldn't be routed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReturnedMessage {
    pub message: Content,
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
}

/// A message published by the client.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishedMessage {
    pub message: Content,
    pub mandatory: bool,
    pub immediate: bool,
}

/// Internally it is comfortable to handle delivered or returned message in the same variable.
#[derive(Debug)]
pub(crate) enum Message {
    Delivered(DeliveredMessage),
    Returned(ReturnedMessage),
}

impl Message {
    pub(crate) fn content_mut(&mut self) -> &mut Content {
        match self {
            Message::Delivered(dm) => &mut dm.message,
            Message::Returned(rm) => &mut rm.message,
        }
    }
}

/// Content header and the body frames of a message, the body is split by `frame_max`.
pub(crate) fn to_content_frames(
    channel: ChannelNumber,
    message: Content,
    frame_max: u32,
) -> (ContentHeaderFrame, Vec<ContentBodyFrame>) {
    let props = message.properties;

    let header = ContentHeaderFrame {
        content_type: props.content_type,
        content_encoding: props.content_encoding,
        headers: props.headers,
        delivery_mode: props.delivery_mode,
        priority: props.priority,
        correlation_id: props.correlation_id,
        reply_to: props.reply_to,
        expiration: props.expiration,
        message_id: props.message_id,
        timestamp: props.timestamp,
        message_type: props.message_type,
        user_id: props.user_id,
        app_id: props.app_id,
        ..ContentHeaderFrame::new(channel, message.body.len() as u64)
    };

    let bodies = content::split_body(channel, &message.body, frame_max);

    (header, bodies)
}

impl From<ContentHeaderFrame> for MessageProperties {
    fn from(value: ContentHeaderFrame) -> Self {
        MessageProperties {
            content_type: value.content_type,
            content_encoding: value.content_encoding,
            headers: value.headers,
            delivery_mode: value.delivery_mode,
            priority: value.priority,
            correlation_id: value.correlation_id,
            reply_to: value.reply_to,
            expiration: value.expiration,
            message_id: value.message_id,
            timestamp: value.timestamp,
            message_type: value.message_type,
            user_id: value.user_id,
            app_id: value.app_id,
        }
    }
}

impl From<&str> for PublishedMessage {
    fn from(value: &str) -> Self {
        PublishedMessage::default().str(value)
    }
}

impl From<String> for PublishedMessage {
    fn from(value: String) -> Self {
        PublishedMessage::default().body(value.into_bytes())
    }
}

impl From<Vec<u8>> for PublishedMessage {
    fn from(value: Vec<u8>) -> Self {
        PublishedMessage::default().body(value)
    }
}

impl From<&[u8]> for PublishedMessage {
    fn from(value: &[u8]) -> Self {
        PublishedMessage::default().body(value.to_vec())
    }
}

impl PublishedMessage {
    pub fn str(mut self, value: &str) -> Self {
        self.message.body = value.as_bytes().to_vec();
        self
    }

    /// Plain text body with `text/plain` content type.
    pub fn text(mut self, value: &str) -> Self {
        self.message.body = value.as_bytes().to_vec();
        self.message.properties.content_type = Some("text/plain".to_string());
        self
    }

    pub fn body(mut self, value: Vec<u8>) -> Self {
        self.message.body = value;
        self
    }

    pub fn properties(mut self, properties: MessageProperties) -> Self {
        self.message.properties = properties;
        self
    }

    /// The message is written to disk by the server.
    pub fn persistent(mut self, value: bool) -> Self {
        self.message.properties.delivery_mode = Some(if value { 2 } else { 1 });
        self
    }

    pub fn header(mut self, name: &str, value: frame::AMQPFieldValue) -> Self {
        self.message
            .properties
            .headers
            .get_or_insert_with(FieldTable::new)
            .insert(name.to_string(), value);
        self
    }

    /// Condition for mandatory publishing. Mandatory messages are failed if the exchange doesn't have
    /// bound queue or if the routing keys are not matched.
    pub fn mandatory(mut self, value: bool) -> Self {
        self.mandatory = value;
        self
    }

    /// Condition for immediate publishing. Immediate messages are received by a server successfully if
    /// they managed to be sent to a consumer immediately.
    pub fn immediate(mut self, value: bool) -> Self {
        self.immediate = value;
        self
    }
}

impl DeliveredMessage {
    /// The body as a string if it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.message.body).ok()
    }
}
