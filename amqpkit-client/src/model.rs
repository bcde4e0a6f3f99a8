use amqpkit_codec::frame;
use serde_derive::Deserialize;
use std::fmt;

/// AMQP channel number
pub type ChannelNumber = frame::Channel;
/// AMQP class id method id number
pub type ClassMethod = frame::ClassMethod;

/// Error codes in connection scope.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConnectionError {
    /// The server forced to close the connection.
    ConnectionForced = 320,
    /// The client tried to work with an invalid virtual host.
    InvalidPath = 402,
    /// The client tried to access a resource it didn't have access.
    AccessRefused = 403,
    /// The client sent an invalid AMQP frame.
    FrameError = 501,
    /// The client sent a frame which contains erroneous data.
    SyntaxError = 502,
    /// The client sent a frame which didn't fit in the normal order.
    CommandInvalid = 503,
    /// The client tried to access a non-existing or not-opened channel.
    ChannelError = 504,
    /// The client sent an unexpected content header or body frame.
    UnexpectedFrame = 505,
    /// The client tried to exceed the limits of the connection agreed during connection tune.
    ResourceError = 506,
    /// The client tried to work with an entity in a way which is not allowed by the server.
    NotAllowed = 530,
    /// The client tried to use a not implemented funcionality.
    NotImplemented = 540,
    /// The server couldn't fulfill the request because of an intermittent error.
    InternalError = 541,
}

/// Error codes in channel scope.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChannelError {
    /// Denotes successful execution like connection or channel closed.
    Success = 200,
    /// The client attempted to transfer a message which exceeded the limits.
    ContentTooLarge = 311,
    /// The mandatory message cannot be routed to queues.
    NoRoute = 312,
    /// The immediate message cannot be delivered to consumers in the absence of consumers.
    NoConsumers = 313,
    /// The client tried to access a resource it didn't have access.
    AccessRefused = 403,
    /// Queue or entity cannot be found.
    NotFound = 404,
    /// The client cannot access a resource because another client is working on what.
    ResourceLocked = 405,
    /// The work on resource is refused mostly because of validation errors.
    PreconditionFailed = 406,
}

/// Lifecycle of a connection. Transport failure jumps to `Closed` from any state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// The values agreed during `Connection.Tune`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Tuning {
    pub channel_max: u16,
    pub frame_max: u32,
    /// Heartbeat interval in seconds, 0 means there is no heartbeat.
    pub heartbeat: u16,
}

impl Tuning {
    /// Negotiate the proposal of the client with the values the server sent. If one side says 0 the
    /// other value wins, otherwise the smaller one.
    pub fn negotiate(client: &Tuning, server: &frame::ConnectionTuneArgs) -> Tuning {
        Tuning {
            channel_max: negotiate(client.channel_max, server.channel_max),
            frame_max: negotiate(client.frame_max, server.frame_max),
            heartbeat: negotiate(client.heartbeat, server.heartbeat),
        }
    }

    /// The highest channel number which can be opened.
    pub fn max_channel(&self) -> ChannelNumber {
        match self.channel_max {
            0 => ChannelNumber::MAX,
            n => n,
        }
    }
}

fn negotiate<T: Ord + Default + Copy>(client: T, server: T) -> T {
    if client == T::default() {
        server
    } else if server == T::default() {
        client
    } else {
        std::cmp::min(client, server)
    }
}

/// The type of the exchange. Unknown types are passed to the server as they are.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(from = "String")]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
    Headers,
    Other(String),
}

impl ExchangeType {
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
            ExchangeType::Other(t) => t,
        }
    }
}

impl From<&str> for ExchangeType {
    fn from(value: &str) -> Self {
        match value {
            "direct" => ExchangeType::Direct,
            "fanout" => ExchangeType::Fanout,
            "topic" => ExchangeType::Topic,
            "headers" => ExchangeType::Headers,
            other => ExchangeType::Other(other.to_string()),
        }
    }
}

impl From<String> for ExchangeType {
    fn from(value: String) -> Self {
        ExchangeType::from(value.as_str())
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options of `Exchange.Declare`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExchangeDeclareOpts {
    /// Only checks if the exchange exists.
    pub passive: bool,
    /// The exchange survives the restart of the server.
    pub durable: bool,
    /// The exchange is deleted when the last queue is unbound from it.
    pub auto_delete: bool,
    /// The exchange cannot be published to, only other exchanges can route to it.
    pub internal: bool,
}

impl ExchangeDeclareOpts {
    pub fn passive(mut self, mode: bool) -> Self {
        self.passive = mode;
        self
    }

    pub fn durable(mut self, mode: bool) -> Self {
        self.durable = mode;
        self
    }

    pub fn auto_delete(mut self, mode: bool) -> Self {
        self.auto_delete = mode;
        self
    }

    pub fn internal(mut self, mode: bool) -> Self {
        self.internal = mode;
        self
    }

    pub(crate) fn flags(&self) -> frame::ExchangeDeclareFlags {
        let mut flags = frame::ExchangeDeclareFlags::empty();

        flags.set(frame::ExchangeDeclareFlags::PASSIVE, self.passive);
        flags.set(frame::ExchangeDeclareFlags::DURABLE, self.durable);
        flags.set(frame::ExchangeDeclareFlags::AUTO_DELETE, self.auto_delete);
        flags.set(frame::ExchangeDeclareFlags::INTERNAL, self.internal);

        flags
    }
}

/// Options of `Queue.Declare`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueDeclareOpts {
    /// Only checks if the queue exists.
    pub passive: bool,
    /// The queue survives the restart of the server.
    pub durable: bool,
    /// Only this connection can use the queue and it is deleted when the connection closes.
    pub exclusive: bool,
    /// The queue is deleted when the last consumer is cancelled.
    pub auto_delete: bool,
}

impl QueueDeclareOpts {
    pub fn passive(mut self, mode: bool) -> Self {
        self.passive = mode;
        self
    }

    pub fn durable(mut self, mode: bool) -> Self {
        self.durable = mode;
        self
    }

    pub fn exclusive(mut self, mode: bool) -> Self {
        self.exclusive = mode;
        self
    }

    pub fn auto_delete(mut self, mode: bool) -> Self {
        self.auto_delete = mode;
        self
    }

    pub(crate) fn flags(&self) -> frame::QueueDeclareFlags {
        let mut flags = frame::QueueDeclareFlags::empty();

        flags.set(frame::QueueDeclareFlags::PASSIVE, self.passive);
        flags.set(frame::QueueDeclareFlags::DURABLE, self.durable);
        flags.set(frame::QueueDeclareFlags::EXCLUSIVE, self.exclusive);
        flags.set(frame::QueueDeclareFlags::AUTO_DELETE, self.auto_delete);

        flags
    }
}

/// Delete the exchange or queue only if it is not in use.
pub struct IfUnused(pub bool);
/// Delete the queue only if it has no messages.
pub struct IfEmpty(pub bool);
