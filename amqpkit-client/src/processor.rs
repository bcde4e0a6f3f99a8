//! The processor owns the transport. One task reads and dispatches the incoming frames and the
//! client requests, another one writes the outgoing frames and the heartbeats. Channels and
//! consumers never touch the transport, they send `ClientRequest`s and wait on oneshot channels.
use crate::client_api::EventSignal;
use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::message::Content;
use crate::model::{ChannelNumber, ConnectionState, Tuning};
use crate::publisher::Confirmation;
use crate::state::{self, ClientState};
use crate::Result;
use amqpkit_codec::codec::{AMQPCodec, Frame, FRAME_MIN_SIZE};
use amqpkit_codec::frame::{self, AMQPFrame, MethodFrameArgs};
use bytes::BytesMut;
use futures::stream::StreamExt;
use log::{debug, error, info, trace, warn};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::{Encoder, FramedRead};

pub(crate) type ConsumerSink = mpsc::UnboundedSender<crate::consumer::ConsumerSignal>;
pub(crate) type EventSink = mpsc::UnboundedSender<EventSignal>;
pub(crate) type FrameResponse = oneshot::Sender<Result<MethodFrameArgs>>;
pub(crate) type ConfirmResponse = oneshot::Sender<Result<Confirmation>>;

/// Channel number and epoch of an opened channel. A reused channel number gets a new epoch, so
/// requests of a stale `Channel` can be told apart.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct OpenedChannel {
    pub(crate) channel: ChannelNumber,
    pub(crate) epoch: u64,
}

/// Represent a client request. It can be sending a frame, consume a queue or publish data.
pub(crate) enum Param {
    Connect,
    ChannelOpen(Option<ChannelNumber>),
    Frame(u64, Box<AMQPFrame>),
    Consume(u64, Box<AMQPFrame>, ConsumerSink),
    Publish(u64, frame::BasicPublishArgs, Content, Option<ConfirmResponse>),
    Close,
}

pub(crate) enum WaitFor {
    /// The frames are written to the transport.
    SentOut(oneshot::Sender<Result<()>>),
    /// The response method frame arrived.
    FrameResponse(FrameResponse),
    ChannelOpen(oneshot::Sender<Result<OpenedChannel>>),
}

impl WaitFor {
    pub(crate) fn fail(self, err: ClientError) {
        let _ = match self {
            WaitFor::SentOut(tx) => tx.send(Err(err)).is_ok(),
            WaitFor::FrameResponse(tx) => tx.send(Err(err)).is_ok(),
            WaitFor::ChannelOpen(tx) => tx.send(Err(err)).is_ok(),
        };
    }
}

/// Represents a client request, typically send a frame and wait for the answer of the server.
pub(crate) struct ClientRequest {
    pub(crate) param: Param,
    pub(crate) response: Option<WaitFor>,
}

impl fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.param {
            Param::Connect => write!(f, "Connect"),
            Param::ChannelOpen(ch) => write!(f, "ChannelOpen{{Channel={:?}}}", ch),
            Param::Frame(_, frame) => write!(f, "Request{{Frame={:?}}}", frame),
            Param::Consume(_, frame, _) => write!(f, "Request{{Consume={:?}}}", frame),
            Param::Publish(_, args, content, confirm) => write!(
                f,
                "Request{{Publish={:?}, BodySize={}, Confirm={}}}",
                args,
                content.body.len(),
                confirm.is_some()
            ),
            Param::Close => write!(f, "Close"),
        }
    }
}

/// Encoded frames to be written out. `written` is notified when the bytes are accepted by the
/// transport.
pub(crate) struct OutgoingFrame {
    pub(crate) data: BytesMut,
    pub(crate) written: Option<oneshot::Sender<Result<()>>>,
}

/// What the connection tells about itself to the api side.
#[derive(Clone, Debug)]
pub(crate) struct Status {
    pub(crate) state: ConnectionState,
    pub(crate) tuning: Tuning,
    /// The error which closed the connection, every later call fails with it.
    pub(crate) error: Option<ClientError>,
}

/// The api side handle of the processor.
#[derive(Clone)]
pub(crate) struct ClientRequestSink {
    requests: mpsc::Sender<ClientRequest>,
    status: watch::Receiver<Status>,
    pub(crate) publish_timeout: Option<Duration>,
}

impl fmt::Debug for ClientRequestSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRequestSink")
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl ClientRequestSink {
    pub(crate) async fn send(&self, request: ClientRequest) -> Result<()> {
        if self.requests.send(request).await.is_err() {
            return Err(self.terminal_error());
        }

        Ok(())
    }

    /// The error every call gets once the processor is stopped.
    pub(crate) fn terminal_error(&self) -> ClientError {
        self.status.borrow().error.clone().unwrap_or(ClientError::Cancelled)
    }

    pub(crate) fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub(crate) async fn wait_closed(&self) {
        let mut status = self.status.clone();

        let _ = status.wait_for(|s| s.state == ConnectionState::Closed).await;
    }
}

/// Wait for the response of a request. If the processor stopped meanwhile the terminal error of the
/// connection is the result.
pub(crate) async fn response<T>(sink: &ClientRequestSink, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(sink.terminal_error()),
    }
}

/// Send a method frame and wait for the response frame.
pub(crate) async fn call(sink: &ClientRequestSink, epoch: u64, f: AMQPFrame) -> Result<MethodFrameArgs> {
    let (tx, rx) = oneshot::channel();

    sink.send(ClientRequest {
        param: Param::Frame(epoch, Box::new(f)),
        response: Some(WaitFor::FrameResponse(tx)),
    })
    .await?;

    response(sink, rx).await
}

/// Send a method frame and wait until it is written out.
pub(crate) async fn sync_send(sink: &ClientRequestSink, epoch: u64, f: AMQPFrame) -> Result<()> {
    let (tx, rx) = oneshot::channel();

    sink.send(ClientRequest {
        param: Param::Frame(epoch, Box::new(f)),
        response: Some(WaitFor::SentOut(tx)),
    })
    .await?;

    response(sink, rx).await
}

/// Start the reader and the writer tasks on `stream`. The handshake is started by a
/// `Param::Connect` request.
pub(crate) fn start<S>(stream: S, config: &ConnectionConfig) -> (ClientRequestSink, mpsc::UnboundedReceiver<EventSignal>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (request_tx, request_rx) = mpsc::channel(64);
    let (out_tx, out_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (failed_tx, failed_rx) = oneshot::channel();
    let (status_tx, status_rx) = watch::channel(Status {
        state: ConnectionState::Connecting,
        tuning: Tuning::default(),
        error: None,
    });

    // I/O output port, handles outgoing frames sent via a channel.
    tokio::spawn(handle_outgoing(writer, out_rx, status_rx.clone(), failed_tx));

    let cs = state::new(config, out_tx, event_tx, status_tx);

    // Until tuning only the minimum frame size is accepted from the server.
    tokio::spawn(socket_loop(
        FramedRead::new(reader, AMQPCodec::new(FRAME_MIN_SIZE)),
        request_rx,
        cs,
        failed_rx,
    ));

    let sink = ClientRequestSink {
        requests: request_tx,
        status: status_rx,
        publish_timeout: config.publish_timeout,
    };

    (sink, event_rx)
}

async fn socket_loop<R>(
    mut stream: FramedRead<R, AMQPCodec>,
    mut requests: mpsc::Receiver<ClientRequest>,
    mut cs: ClientState,
    mut write_failed: oneshot::Receiver<ClientError>,
) where
    R: AsyncRead + Unpin,
{
    let mut last_received = Instant::now();

    loop {
        let heartbeat_timeout = cs.heartbeat_timeout();

        tokio::select! {
            // Receiving incoming frames. Here we can handle any IO error and the
            // closing of the input stream (server closes the stream).
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Frame::Frame(f))) => {
                        last_received = Instant::now();

                        let tune = matches!(f, AMQPFrame::Method(0, frame::CONNECTION_TUNE, _));

                        if let Err(e) = handle_in_frame(f, &mut cs).await {
                            error!("Closing connection {:?}", e);

                            if let ClientError::Protocol(text) = &e {
                                cs.send_close(amqpkit_codec::UNEXPECTED_FRAME, text).await;
                            }

                            cs.connection_failed(e);
                            break;
                        }

                        if tune {
                            stream.decoder_mut().set_frame_max(cs.tuning().frame_max);
                        }
                    }
                    Some(Ok(Frame::Frames(fs))) => {
                        warn!("Decoder gave {} frames in a batch, dropping them", fs.len());
                    }
                    Some(Err(e)) => {
                        error!("Error reading frames {:?}", e);

                        if !e.is_io_error() {
                            cs.send_close(e.code, &e.message).await;
                        }

                        cs.connection_failed(e.into());
                        break;
                    }
                    None => {
                        cs.transport_closed();
                        break;
                    }
                }
            }
            request = requests.recv() => {
                match request {
                    Some(request) => {
                        debug!("Incoming client request {:?}", request);

                        if let Err(e) = cs.handle_request(request).await {
                            error!("Error handling request {:?}", e);

                            cs.connection_failed(e);
                            break;
                        }
                    }
                    None => {
                        info!("Every client handle is dropped, closing connection");

                        cs.fail_all(ClientError::Cancelled);
                        break;
                    }
                }
            }
            _ = silence(heartbeat_timeout, last_received) => {
                let timeout = heartbeat_timeout.unwrap_or_default();

                error!("No frame from server in {:?}", timeout);

                cs.connection_failed(ClientError::HeartbeatTimeout(timeout));
                break;
            }
            _ = deadline(cs.close_deadline()) => {
                warn!("No Connection.CloseOk in time, dropping the connection");

                cs.close_finished();
                break;
            }
            failed = &mut write_failed => {
                let err = failed.unwrap_or_else(|_| ClientError::Network("writer task stopped".to_string()));

                cs.connection_failed(err);
                break;
            }
        }

        if cs.is_closed() {
            break;
        }
    }

    debug!("Socket loop is finished");
}

async fn silence(timeout: Option<Duration>, since: Instant) {
    match timeout {
        Some(timeout) => tokio::time::sleep_until(since + timeout).await,
        None => futures::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}

async fn idle(heartbeat: Option<Duration>, since: Instant) {
    silence(heartbeat, since).await
}

/// The negotiated heartbeat interval, `None` before tuning or when heartbeats are switched off.
fn heartbeat_interval(status: &watch::Receiver<Status>) -> Option<Duration> {
    match status.borrow().tuning.heartbeat {
        0 => None,
        secs => Some(Duration::from_secs(secs as u64)),
    }
}

fn heartbeat_frame() -> BytesMut {
    let mut data = BytesMut::with_capacity(8);

    if let Err(e) = AMQPCodec::default().encode(Frame::Frame(frame::heartbeat()), &mut data) {
        error!("Cannot encode heartbeat {:?}", e);
    }

    data
}

/// Write out the encoded frames one by one. If nothing is written for a heartbeat interval it
/// sends a heartbeat frame. The interval is read from the tuning in the connection status, so
/// heartbeats start once `Connection.TuneOk` is on its way.
async fn handle_outgoing<W>(
    mut writer: W,
    mut outgoing: mpsc::Receiver<OutgoingFrame>,
    status: watch::Receiver<Status>,
    failed: oneshot::Sender<ClientError>,
) where
    W: AsyncWrite + Unpin,
{
    let mut last_write = Instant::now();

    loop {
        let heartbeat = heartbeat_interval(&status);

        let OutgoingFrame { data, written } = tokio::select! {
            next = outgoing.recv() => {
                match next {
                    Some(of) => of,
                    None => break,
                }
            }
            _ = idle(heartbeat, last_write) => {
                trace!("Sending heartbeat");

                OutgoingFrame {
                    data: heartbeat_frame(),
                    written: None,
                }
            }
        };

        trace!("Outgoing {} bytes", data.len());

        let result = async {
            writer.write_all(&data).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                last_write = Instant::now();

                if let Some(tx) = written {
                    let _ = tx.send(Ok(()));
                }
            }
            Err(e) => {
                error!("Error writing frames {:?}", e);

                let err = ClientError::from(e);

                if let Some(tx) = written {
                    let _ = tx.send(Err(err.clone()));
                }

                let _ = failed.send(err);

                return;
            }
        }
    }

    let _ = writer.shutdown().await;
}

async fn handle_in_frame(f: AMQPFrame, cs: &mut ClientState) -> Result<()> {
    trace!("Incoming frame {:?}", f);

    match f {
        AMQPFrame::Header => Err(ClientError::Protocol(
            "server doesn't support AMQP 0-9-1".to_string(),
        )),
        AMQPFrame::Method(ch, cm, args) => handle_in_method_frame(ch, cm, args, cs).await,
        AMQPFrame::ContentHeader(header) => cs.content_header(header),
        AMQPFrame::ContentBody(body) => cs.content_body(body),
        AMQPFrame::Heartbeat(_) => Ok(()),
    }
}

/// Handle AMQP frames coming from the server side
async fn handle_in_method_frame(
    channel: ChannelNumber,
    cm: frame::ClassMethod,
    ma: MethodFrameArgs,
    cs: &mut ClientState,
) -> Result<()> {
    use MethodFrameArgs::*;

    match ma {
        ConnectionStart(args) => cs.connection_start(args).await,
        ConnectionTune(args) => cs.connection_tune(args).await,
        ConnectionOpenOk => cs.connection_open_ok(),
        ConnectionClose(args) => cs.handle_connection_close(args).await,
        ConnectionCloseOk => cs.connection_close_ok(),
        ConnectionBlocked(args) => cs.connection_blocked(args),
        ConnectionUnblocked => cs.connection_unblocked().await,
        ChannelOpenOk => cs.channel_open_ok(channel).await,
        ChannelFlow(args) => cs.channel_flow(channel, args).await,
        ChannelClose(args) => cs.handle_channel_close(channel, args).await,
        ChannelCloseOk => cs.channel_close_ok(channel),
        BasicCancel(args) => cs.on_basic_cancel(channel, args).await,
        BasicDeliver(args) => cs.basic_deliver(channel, args),
        BasicReturn(args) => cs.basic_return(channel, args),
        BasicAck(args) => cs.on_basic_ack(channel, args),
        BasicNack(args) => cs.on_basic_nack(channel, args),
        ok @ (ExchangeDeclareOk
        | ExchangeDeleteOk
        | QueueDeclareOk(_)
        | QueueBindOk
        | QueuePurgeOk(_)
        | QueueDeleteOk(_)
        | QueueUnbindOk
        | BasicQosOk
        | BasicConsumeOk(_)
        | BasicCancelOk(_)
        | ConfirmSelectOk
        | ChannelFlowOk(_)) => cs.rpc_response(channel, cm, ok),
        other => Err(ClientError::Protocol(format!(
            "unexpected method {:08X} from server: {:?}",
            cm, other
        ))),
    }
}

/// A sink whose requests are answered by the test itself.
#[cfg(test)]
pub(crate) fn test_sink() -> (ClientRequestSink, mpsc::Receiver<ClientRequest>) {
    let (requests, rx) = mpsc::channel(16);
    let (_, status) = watch::channel(Status {
        state: ConnectionState::Open,
        tuning: Tuning::default(),
        error: None,
    });

    let sink = ClientRequestSink {
        requests,
        status,
        publish_timeout: None,
    };

    (sink, rx)
}
