use crate::model::{ChannelError, ChannelNumber, ClassMethod};
use amqpkit_codec::FrameError;
use std::time::Duration;

/// Every failure the client reports.
///
/// Errors which are fatal to the connection are propagated to every pending and future call on
/// any channel of that connection, errors of an RPC resolve only the caller which waits for it.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// Transport failure, the connection can be re-established.
    #[error("network error: {0}")]
    Network(String),
    /// Malformed frame or a frame which breaks the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server rejected the credentials or the access to the virtual host.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// All the channel numbers allowed by the negotiated channel max are in use.
    #[error("all the {0} channels are in use")]
    ChannelLimitExceeded(u16),
    /// The server was silent for two heartbeat intervals.
    #[error("no heartbeat from the server in {0:?}")]
    HeartbeatTimeout(Duration),
    /// Exchange or queue is re-declared with different attributes.
    #[error("{entity} {name:?} is already declared with different attributes: {text}")]
    DeclarationConflict {
        entity: &'static str,
        name: String,
        text: String,
    },
    /// The operation was aborted because the channel or the connection is shutting down.
    #[error("operation cancelled")]
    Cancelled,
    /// The server closed the connection.
    #[error("connection closed by server {code} {text} (method {class_method:08X})")]
    ConnectionClosed {
        code: u16,
        text: String,
        class_method: ClassMethod,
    },
    /// The server closed the channel.
    #[error("channel {channel} closed by server {code} {text} (method {class_method:08X})")]
    ChannelClosed {
        channel: ChannelNumber,
        code: u16,
        text: String,
        class_method: ClassMethod,
    },
    /// A deadline of the caller elapsed, like publishing while the flow is stopped.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Publishing of a sequence stopped at the first failure.
    #[error("{sent} messages were sent before the failure: {source}")]
    PartialSend { sent: usize, source: Box<ClientError> },
    /// Invalid url or configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// The error closes the connection, every further call on it fails.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Network(_)
                | ClientError::Protocol(_)
                | ClientError::Auth(_)
                | ClientError::HeartbeatTimeout(_)
                | ClientError::ConnectionClosed { .. }
        )
    }

    /// The error can go away by reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Network(_) | ClientError::HeartbeatTimeout(_))
    }

    /// The reply code of a server side close.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            ClientError::ConnectionClosed { code, .. } | ClientError::ChannelClosed { code, .. } => Some(*code),
            ClientError::PartialSend { source, .. } => source.reply_code(),
            _ => None,
        }
    }

    /// Turn a `406 PRECONDITION_FAILED` channel close into a declaration conflict of `entity`.
    pub(crate) fn into_conflict(self, entity: &'static str, name: &str) -> ClientError {
        match self {
            ClientError::ChannelClosed { code, text, .. } if code == ChannelError::PreconditionFailed as u16 => {
                ClientError::DeclarationConflict {
                    entity,
                    name: name.to_string(),
                    text,
                }
            }
            other => other,
        }
    }
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self {
        if err.is_io_error() {
            ClientError::Network(err.message)
        } else {
            ClientError::Protocol(format!("{} {}", err.code, err.message))
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Network(err.to_string())
    }
}
