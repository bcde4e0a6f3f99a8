use crate::frame::*;
use crate::{frame_error, Result, FRAME_ERROR, SYNTAX_ERROR, UNEXPECTED_FRAME};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const FRAME_METHOD_FRAME: u8 = 0x01;
const FRAME_CONTENT_HEADER: u8 = 0x02;
const FRAME_CONTENT_BODY: u8 = 0x03;
const FRAME_HEARTBEAT: u8 = 0x08;
const FRAME_AMQP_VERSION: u8 = 0x41;
const FRAME_END: u8 = 0xCE;

/// Size of the frame type, channel and size fields plus the frame end octet.
pub const FRAME_OVERHEAD: usize = 8;

/// Frame size a client may always send before tuning.
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Encoder and decoder of AMQP frames.
///
/// The default codec accepts frames of any size. A client decodes with `new(FRAME_MIN_SIZE)`
/// until tuning, then `set_frame_max` applies the negotiated limit to both directions.
#[derive(Debug, Default)]
pub struct AMQPCodec {
    frame_max: u32,
}

impl AMQPCodec {
    pub fn new(frame_max: u32) -> Self {
        Self { frame_max }
    }

    /// Set the negotiated maximum frame size. 0 means no limit.
    pub fn set_frame_max(&mut self, frame_max: u32) {
        self.frame_max = frame_max;
    }

    pub fn frame_max(&self) -> u32 {
        self.frame_max
    }

    fn check_frame_size(&self, payload_len: usize) -> Result<()> {
        if self.frame_max > 0 && payload_len + FRAME_OVERHEAD > self.frame_max as usize {
            return frame_error!(
                FRAME_ERROR,
                format!("Frame size {} exceeds frame max {}", payload_len + FRAME_OVERHEAD, self.frame_max)
            );
        }

        Ok(())
    }
}

#[derive(Debug)]
pub enum Frame {
    Frame(AMQPFrame),
    Frames(Vec<AMQPFrame>),
}

impl From<AMQPFrame> for Frame {
    fn from(frame: AMQPFrame) -> Self {
        Frame::Frame(frame)
    }
}

impl Encoder<Frame> for AMQPCodec {
    type Error = crate::FrameError;

    fn encode(&mut self, event: Frame, buf: &mut BytesMut) -> Result<()> {
        // Frames are encoded aside, so a failing frame leaves nothing half written in the buffer.
        let mut out = BytesMut::new();

        match event {
            Frame::Frame(frame) => encode_amqp_frame(&mut out, frame)?,
            Frame::Frames(frames) => {
                for frame in frames {
                    encode_amqp_frame(&mut out, frame)?;
                }
            }
        }

        if self.frame_max > 0 {
            check_encoded_sizes(&out, self)?;
        }

        buf.unsplit(out);

        Ok(())
    }
}

impl Decoder for AMQPCodec {
    type Item = Frame;
    type Error = crate::FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }

        if src[0] == FRAME_AMQP_VERSION {
            if src.len() < 8 {
                return Ok(None);
            }

            let head = src.split_to(8);
            if &head[..4] != b"AMQP" {
                return frame_error!(FRAME_ERROR, "Invalid protocol header");
            }

            return Ok(Some(Frame::Frame(AMQPFrame::Header)));
        }

        if src.len() < 7 {
            return Ok(None);
        }

        let frame_type = src[0];
        if !matches!(
            frame_type,
            FRAME_METHOD_FRAME | FRAME_CONTENT_HEADER | FRAME_CONTENT_BODY | FRAME_HEARTBEAT
        ) {
            return frame_error!(FRAME_ERROR, format!("Unknown frame type {}", frame_type));
        }

        let channel = u16::from_be_bytes([src[1], src[2]]);
        let frame_len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;

        self.check_frame_size(frame_len)?;

        if src.len() < frame_len + FRAME_OVERHEAD {
            src.reserve(frame_len + FRAME_OVERHEAD - src.len());

            return Ok(None);
        }

        if src[frame_len + 7] != FRAME_END {
            return frame_error!(FRAME_ERROR, "Frame end octet is missing");
        }

        src.advance(7);
        let mut frame_buf = src.split_to(frame_len);
        src.advance(1);

        let frame = match frame_type {
            FRAME_METHOD_FRAME => decode_method_frame(&mut frame_buf, channel)?,
            FRAME_CONTENT_HEADER => decode_content_header_frame(&mut frame_buf, channel)?,
            FRAME_CONTENT_BODY => AMQPFrame::ContentBody(ContentBodyFrame {
                channel,
                body: frame_buf.to_vec(),
            }),
            _ => {
                if channel != 0 {
                    return frame_error!(FRAME_ERROR, "Heartbeat frame on a non-zero channel");
                }

                AMQPFrame::Heartbeat(channel)
            }
        };

        Ok(Some(Frame::Frame(frame)))
    }
}

/// Walk through the encoded frames and check every payload against the frame max.
fn check_encoded_sizes(buf: &BytesMut, codec: &AMQPCodec) -> Result<()> {
    let mut pos = 0usize;

    while pos < buf.len() {
        if buf[pos] == FRAME_AMQP_VERSION {
            pos += 8;
            continue;
        }

        let len = u32::from_be_bytes([buf[pos + 3], buf[pos + 4], buf[pos + 5], buf[pos + 6]]) as usize;
        codec.check_frame_size(len)?;

        pos += len + FRAME_OVERHEAD;
    }

    Ok(())
}

fn ensure(src: &BytesMut, len: usize) -> Result<()> {
    if src.remaining() < len {
        return frame_error!(SYNTAX_ERROR, "Frame is shorter than its arguments");
    }

    Ok(())
}

fn get_u8(src: &mut BytesMut) -> Result<u8> {
    ensure(src, 1)?;
    Ok(src.get_u8())
}

fn get_u16(src: &mut BytesMut) -> Result<u16> {
    ensure(src, 2)?;
    Ok(src.get_u16())
}

fn get_u32(src: &mut BytesMut) -> Result<u32> {
    ensure(src, 4)?;
    Ok(src.get_u32())
}

fn get_u64(src: &mut BytesMut) -> Result<u64> {
    ensure(src, 8)?;
    Ok(src.get_u64())
}

fn get_bool(src: &mut BytesMut) -> Result<bool> {
    Ok(get_u8(src)? & 0x01 != 0)
}

fn decode_method_frame(src: &mut BytesMut, channel: u16) -> Result<AMQPFrame> {
    let class_method = get_u32(src)?;

    let method_frame_args = match class_method {
        CONNECTION_START => decode_connection_start(src)?,
        CONNECTION_START_OK => decode_connection_start_ok(src)?,
        CONNECTION_TUNE => decode_connection_tune(src)?,
        CONNECTION_TUNE_OK => decode_connection_tune_ok(src)?,
        CONNECTION_OPEN => decode_connection_open(src)?,
        CONNECTION_OPEN_OK => {
            let _known_hosts = decode_short_string(src)?;
            MethodFrameArgs::ConnectionOpenOk
        }
        CONNECTION_CLOSE => decode_connection_close(src)?,
        CONNECTION_CLOSE_OK => MethodFrameArgs::ConnectionCloseOk,
        CONNECTION_BLOCKED => MethodFrameArgs::ConnectionBlocked(ConnectionBlockedArgs {
            reason: decode_short_string(src)?,
        }),
        CONNECTION_UNBLOCKED => MethodFrameArgs::ConnectionUnblocked,
        CHANNEL_OPEN => {
            let _out_of_band = decode_short_string(src)?;
            MethodFrameArgs::ChannelOpen
        }
        CHANNEL_OPEN_OK => {
            let _channel_id = decode_long_string(src)?;
            MethodFrameArgs::ChannelOpenOk
        }
        CHANNEL_FLOW => MethodFrameArgs::ChannelFlow(ChannelFlowArgs::new(get_bool(src)?)),
        CHANNEL_FLOW_OK => MethodFrameArgs::ChannelFlowOk(ChannelFlowArgs::new(get_bool(src)?)),
        CHANNEL_CLOSE => decode_channel_close(src)?,
        CHANNEL_CLOSE_OK => MethodFrameArgs::ChannelCloseOk,
        EXCHANGE_DECLARE => decode_exchange_declare(src)?,
        EXCHANGE_DECLARE_OK => MethodFrameArgs::ExchangeDeclareOk,
        EXCHANGE_DELETE => decode_exchange_delete(src)?,
        EXCHANGE_DELETE_OK => MethodFrameArgs::ExchangeDeleteOk,
        QUEUE_DECLARE => decode_queue_declare(src)?,
        QUEUE_DECLARE_OK => decode_queue_declare_ok(src)?,
        QUEUE_BIND => decode_queue_bind(src)?,
        QUEUE_BIND_OK => MethodFrameArgs::QueueBindOk,
        QUEUE_PURGE => decode_queue_purge(src)?,
        QUEUE_PURGE_OK => MethodFrameArgs::QueuePurgeOk(QueuePurgeOkArgs {
            message_count: get_u32(src)?,
        }),
        QUEUE_DELETE => decode_queue_delete(src)?,
        QUEUE_DELETE_OK => MethodFrameArgs::QueueDeleteOk(QueueDeleteOkArgs {
            message_count: get_u32(src)?,
        }),
        QUEUE_UNBIND => decode_queue_unbind(src)?,
        QUEUE_UNBIND_OK => MethodFrameArgs::QueueUnbindOk,
        BASIC_QOS => decode_basic_qos(src)?,
        BASIC_QOS_OK => MethodFrameArgs::BasicQosOk,
        BASIC_CONSUME => decode_basic_consume(src)?,
        BASIC_CONSUME_OK => MethodFrameArgs::BasicConsumeOk(BasicConsumeOkArgs {
            consumer_tag: decode_short_string(src)?,
        }),
        BASIC_CANCEL => MethodFrameArgs::BasicCancel(BasicCancelArgs {
            consumer_tag: decode_short_string(src)?,
            no_wait: get_bool(src)?,
        }),
        BASIC_CANCEL_OK => MethodFrameArgs::BasicCancelOk(BasicCancelOkArgs {
            consumer_tag: decode_short_string(src)?,
        }),
        BASIC_PUBLISH => decode_basic_publish(src)?,
        BASIC_RETURN => decode_basic_return(src)?,
        BASIC_DELIVER => decode_basic_deliver(src)?,
        BASIC_ACK => MethodFrameArgs::BasicAck(BasicAckArgs {
            delivery_tag: get_u64(src)?,
            multiple: get_bool(src)?,
        }),
        BASIC_REJECT => MethodFrameArgs::BasicReject(BasicRejectArgs {
            delivery_tag: get_u64(src)?,
            requeue: get_bool(src)?,
        }),
        BASIC_NACK => MethodFrameArgs::BasicNack(BasicNackArgs {
            delivery_tag: get_u64(src)?,
            flags: BasicNackFlags::from_bits_truncate(get_u8(src)?),
        }),
        CONFIRM_SELECT => MethodFrameArgs::ConfirmSelect(ConfirmSelectArgs {
            no_wait: get_bool(src)?,
        }),
        CONFIRM_SELECT_OK => MethodFrameArgs::ConfirmSelectOk,
        _ => {
            return frame_error!(
                UNEXPECTED_FRAME,
                format!("Unknown class method {:08X}", class_method)
            )
        }
    };

    Ok(AMQPFrame::Method(channel, class_method, method_frame_args))
}

fn decode_connection_start(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let args = ConnectionStartArgs {
        version_major: get_u8(src)?,
        version_minor: get_u8(src)?,
        properties: decode_field_table(src)?,
        mechanisms: decode_long_string(src)?,
        locales: decode_long_string(src)?,
    };

    Ok(MethodFrameArgs::ConnectionStart(args))
}

fn decode_connection_start_ok(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let args = ConnectionStartOkArgs {
        properties: decode_field_table(src)?,
        mechanism: decode_short_string(src)?,
        response: decode_long_string(src)?,
        locale: decode_short_string(src)?,
    };

    Ok(MethodFrameArgs::ConnectionStartOk(args))
}

fn decode_connection_tune(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let args = ConnectionTuneArgs {
        channel_max: get_u16(src)?,
        frame_max: get_u32(src)?,
        heartbeat: get_u16(src)?,
    };

    Ok(MethodFrameArgs::ConnectionTune(args))
}

fn decode_connection_tune_ok(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let args = ConnectionTuneOkArgs {
        channel_max: get_u16(src)?,
        frame_max: get_u32(src)?,
        heartbeat: get_u16(src)?,
    };

    Ok(MethodFrameArgs::ConnectionTuneOk(args))
}

fn decode_connection_open(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let virtual_host = decode_short_string(src)?;
    let _reserved = decode_short_string(src)?;
    let insist = get_bool(src)?;

    Ok(MethodFrameArgs::ConnectionOpen(ConnectionOpenArgs { virtual_host, insist }))
}

fn decode_connection_close(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let args = ConnectionCloseArgs {
        code: get_u16(src)?,
        text: decode_short_string(src)?,
        class_id: get_u16(src)?,
        method_id: get_u16(src)?,
    };

    Ok(MethodFrameArgs::ConnectionClose(args))
}

fn decode_channel_close(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let args = ChannelCloseArgs {
        code: get_u16(src)?,
        text: decode_short_string(src)?,
        class_id: get_u16(src)?,
        method_id: get_u16(src)?,
    };

    Ok(MethodFrameArgs::ChannelClose(args))
}

fn decode_exchange_declare(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;
    let args = ExchangeDeclareArgs {
        exchange_name: decode_short_string(src)?,
        exchange_type: decode_short_string(src)?,
        flags: ExchangeDeclareFlags::from_bits_truncate(get_u8(src)?),
        args: decode_field_table(src)?,
    };

    Ok(MethodFrameArgs::ExchangeDeclare(args))
}

fn decode_exchange_delete(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;
    let args = ExchangeDeleteArgs {
        exchange_name: decode_short_string(src)?,
        flags: ExchangeDeleteFlags::from_bits_truncate(get_u8(src)?),
    };

    Ok(MethodFrameArgs::ExchangeDelete(args))
}

fn decode_queue_declare(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;
    let args = QueueDeclareArgs {
        name: decode_short_string(src)?,
        flags: QueueDeclareFlags::from_bits_truncate(get_u8(src)?),
        args: decode_field_table(src)?,
    };

    Ok(MethodFrameArgs::QueueDeclare(args))
}

fn decode_queue_declare_ok(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let args = QueueDeclareOkArgs {
        name: decode_short_string(src)?,
        message_count: get_u32(src)?,
        consumer_count: get_u32(src)?,
    };

    Ok(MethodFrameArgs::QueueDeclareOk(args))
}

fn decode_queue_bind(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;
    let args = QueueBindArgs {
        queue_name: decode_short_string(src)?,
        exchange_name: decode_short_string(src)?,
        routing_key: decode_short_string(src)?,
        no_wait: get_bool(src)?,
        args: decode_field_table(src)?,
    };

    Ok(MethodFrameArgs::QueueBind(args))
}

fn decode_queue_purge(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;
    let args = QueuePurgeArgs {
        queue_name: decode_short_string(src)?,
        no_wait: get_bool(src)?,
    };

    Ok(MethodFrameArgs::QueuePurge(args))
}

fn decode_queue_delete(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;
    let args = QueueDeleteArgs {
        queue_name: decode_short_string(src)?,
        flags: QueueDeleteFlags::from_bits_truncate(get_u8(src)?),
    };

    Ok(MethodFrameArgs::QueueDelete(args))
}

fn decode_queue_unbind(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;
    let args = QueueUnbindArgs {
        queue_name: decode_short_string(src)?,
        exchange_name: decode_short_string(src)?,
        routing_key: decode_short_string(src)?,
        args: decode_field_table(src)?,
    };

    Ok(MethodFrameArgs::QueueUnbind(args))
}

fn decode_basic_qos(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let args = BasicQosArgs {
        prefetch_size: get_u32(src)?,
        prefetch_count: get_u16(src)?,
        global: get_bool(src)?,
    };

    Ok(MethodFrameArgs::BasicQos(args))
}

fn decode_basic_consume(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;
    let args = BasicConsumeArgs {
        queue: decode_short_string(src)?,
        consumer_tag: decode_short_string(src)?,
        flags: BasicConsumeFlags::from_bits_truncate(get_u8(src)?),
        args: decode_field_table(src)?,
    };

    Ok(MethodFrameArgs::BasicConsume(args))
}

fn decode_basic_publish(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;
    let args = BasicPublishArgs {
        exchange_name: decode_short_string(src)?,
        routing_key: decode_short_string(src)?,
        flags: BasicPublishFlags::from_bits_truncate(get_u8(src)?),
    };

    Ok(MethodFrameArgs::BasicPublish(args))
}

fn decode_basic_return(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let args = BasicReturnArgs {
        reply_code: get_u16(src)?,
        reply_text: decode_short_string(src)?,
        exchange_name: decode_short_string(src)?,
        routing_key: decode_short_string(src)?,
    };

    Ok(MethodFrameArgs::BasicReturn(args))
}

fn decode_basic_deliver(src: &mut BytesMut) -> Result<MethodFrameArgs> {
    let args = BasicDeliverArgs {
        consumer_tag: decode_short_string(src)?,
        delivery_tag: get_u64(src)?,
        redelivered: get_bool(src)?,
        exchange_name: decode_short_string(src)?,
        routing_key: decode_short_string(src)?,
    };

    Ok(MethodFrameArgs::BasicDeliver(args))
}

fn decode_content_header_frame(src: &mut BytesMut, channel: u16) -> Result<AMQPFrame> {
    let class_id = get_u16(src)?;
    let weight = get_u16(src)?;
    let body_size = get_u64(src)?;
    let flags = HeaderPropertyFlags::from_bits_truncate(get_u16(src)?);

    let mut header = ContentHeaderFrame {
        channel,
        class_id,
        weight,
        body_size,
        ..Default::default()
    };

    if flags.contains(HeaderPropertyFlags::CONTENT_TYPE) {
        header.content_type = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::CONTENT_ENCODING) {
        header.content_encoding = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::HEADERS) {
        header.headers = Some(decode_field_table(src)?.unwrap_or_default());
    }
    if flags.contains(HeaderPropertyFlags::DELIVERY_MODE) {
        header.delivery_mode = Some(get_u8(src)?);
    }
    if flags.contains(HeaderPropertyFlags::PRIORITY) {
        header.priority = Some(get_u8(src)?);
    }
    if flags.contains(HeaderPropertyFlags::CORRELATION_ID) {
        header.correlation_id = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::REPLY_TO) {
        header.reply_to = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::EXPIRATION) {
        header.expiration = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::MESSAGE_ID) {
        header.message_id = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::TIMESTAMP) {
        header.timestamp = Some(get_u64(src)?);
    }
    if flags.contains(HeaderPropertyFlags::MESSAGE_TYPE) {
        header.message_type = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::USER_ID) {
        header.user_id = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::APP_ID) {
        header.app_id = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::CLUSTER_ID) {
        header.cluster_id = Some(decode_short_string(src)?);
    }

    Ok(AMQPFrame::ContentHeader(header))
}

fn decode_value(buf: &mut BytesMut) -> Result<AMQPFieldValue> {
    let value = match get_u8(buf)? {
        b't' => AMQPFieldValue::Bool(get_u8(buf)? != 0),
        b'b' => AMQPFieldValue::I8(get_u8(buf)? as i8),
        b'B' => AMQPFieldValue::U8(get_u8(buf)?),
        b's' => AMQPFieldValue::I16(get_u16(buf)? as i16),
        b'u' => AMQPFieldValue::U16(get_u16(buf)?),
        b'I' => AMQPFieldValue::I32(get_u32(buf)? as i32),
        b'i' => AMQPFieldValue::U32(get_u32(buf)?),
        b'l' => AMQPFieldValue::I64(get_u64(buf)? as i64),
        b'f' => AMQPFieldValue::F32(f32::from_bits(get_u32(buf)?)),
        b'd' => AMQPFieldValue::F64(f64::from_bits(get_u64(buf)?)),
        b'D' => AMQPFieldValue::Decimal(get_u8(buf)?, get_u32(buf)?),
        b'S' => AMQPFieldValue::LongString(decode_long_string(buf)?),
        b'T' => AMQPFieldValue::Timestamp(get_u64(buf)?),
        b'F' => AMQPFieldValue::FieldTable(Box::new(decode_field_table(buf)?.unwrap_or_default())),
        b'A' => {
            let len = get_u32(buf)? as usize;
            ensure(buf, len)?;

            let mut array_buf = buf.split_to(len);
            let mut values = vec![];

            while array_buf.has_remaining() {
                values.push(decode_value(&mut array_buf)?);
            }

            AMQPFieldValue::FieldArray(values)
        }
        b'x' => {
            let len = get_u32(buf)? as usize;
            ensure(buf, len)?;

            AMQPFieldValue::ByteArray(buf.split_to(len).to_vec())
        }
        b'V' => AMQPFieldValue::Void,
        t => return frame_error!(SYNTAX_ERROR, format!("Unknown field value type {}", t)),
    };

    Ok(value)
}

fn decode_short_string(buf: &mut BytesMut) -> Result<String> {
    let len = get_u8(buf)? as usize;
    ensure(buf, len)?;

    let sb = buf.split_to(len);

    match String::from_utf8(sb.to_vec()) {
        Ok(s) => Ok(s),
        Err(_) => frame_error!(SYNTAX_ERROR, "Short string is not valid UTF-8"),
    }
}

fn decode_long_string(buf: &mut BytesMut) -> Result<String> {
    let len = get_u32(buf)? as usize;
    ensure(buf, len)?;

    let sb = buf.split_to(len);

    match String::from_utf8(sb.to_vec()) {
        Ok(s) => Ok(s),
        Err(_) => frame_error!(SYNTAX_ERROR, "Long string is not valid UTF-8"),
    }
}

/// Decode a field table
///
/// The buffer points to the beginning of the field table which is a `u32` length
/// information. An empty table is decoded as `None`.
fn decode_field_table(buf: &mut BytesMut) -> Result<Option<FieldTable>> {
    let ft_len = get_u32(buf)? as usize;

    if ft_len == 0 {
        return Ok(None);
    }

    ensure(buf, ft_len)?;

    let mut ft_buf = buf.split_to(ft_len);
    let mut table = FieldTable::new();

    while ft_buf.has_remaining() {
        let field_name = decode_short_string(&mut ft_buf)?;
        let field_value = decode_value(&mut ft_buf)?;

        table.insert(field_name, field_value);
    }

    Ok(Some(table))
}

fn encode_amqp_frame(buf: &mut BytesMut, frame: AMQPFrame) -> Result<()> {
    match frame {
        AMQPFrame::Header => buf.put(&b"AMQP\x00\x00\x09\x01"[..]),
        AMQPFrame::Method(ch, cm, args) => encode_method_frame(buf, ch, cm, &args)?,
        AMQPFrame::ContentHeader(header_frame) => encode_content_header_frame(buf, &header_frame)?,
        AMQPFrame::ContentBody(body_frame) => encode_content_body_frame(buf, &body_frame),
        AMQPFrame::Heartbeat(channel) => encode_heartbeat_frame(buf, channel),
    }

    Ok(())
}

/// Write the frame type and channel, reserve the size field and return its position.
fn begin_frame(buf: &mut BytesMut, frame_type: u8, channel: Channel) -> usize {
    buf.put_u8(frame_type);
    buf.put_u16(channel);

    let pos = buf.len();
    buf.put_u32(0);

    pos
}

/// Patch the size field written by `begin_frame` and close the frame.
fn end_frame(buf: &mut BytesMut, size_pos: usize) {
    let size = (buf.len() - size_pos - 4) as u32;

    buf[size_pos..size_pos + 4].copy_from_slice(&size.to_be_bytes());
    buf.put_u8(FRAME_END);
}

fn encode_method_frame(buf: &mut BytesMut, channel: Channel, cm: ClassMethod, args: &MethodFrameArgs) -> Result<()> {
    let size_pos = begin_frame(buf, FRAME_METHOD_FRAME, channel);

    buf.put_u32(cm);

    match args {
        MethodFrameArgs::ConnectionStart(args) => encode_connection_start(buf, args)?,
        MethodFrameArgs::ConnectionStartOk(args) => encode_connection_start_ok(buf, args)?,
        MethodFrameArgs::ConnectionTune(args) => {
            buf.put_u16(args.channel_max);
            buf.put_u32(args.frame_max);
            buf.put_u16(args.heartbeat);
        }
        MethodFrameArgs::ConnectionTuneOk(args) => {
            buf.put_u16(args.channel_max);
            buf.put_u32(args.frame_max);
            buf.put_u16(args.heartbeat);
        }
        MethodFrameArgs::ConnectionOpen(args) => {
            encode_short_string(buf, &args.virtual_host)?;
            encode_short_string(buf, "")?;
            buf.put_u8(args.insist as u8);
        }
        // empty known hosts
        MethodFrameArgs::ConnectionOpenOk => buf.put_u8(0),
        MethodFrameArgs::ConnectionClose(args) => {
            buf.put_u16(args.code);
            encode_short_string(buf, &args.text)?;
            buf.put_u16(args.class_id);
            buf.put_u16(args.method_id);
        }
        MethodFrameArgs::ConnectionCloseOk => (),
        MethodFrameArgs::ConnectionBlocked(args) => encode_short_string(buf, &args.reason)?,
        MethodFrameArgs::ConnectionUnblocked => (),
        MethodFrameArgs::ChannelOpen => buf.put_u8(0),
        MethodFrameArgs::ChannelOpenOk => buf.put_u32(0),
        MethodFrameArgs::ChannelFlow(args) | MethodFrameArgs::ChannelFlowOk(args) => buf.put_u8(args.active as u8),
        MethodFrameArgs::ChannelClose(args) => {
            buf.put_u16(args.code);
            encode_short_string(buf, &args.text)?;
            buf.put_u16(args.class_id);
            buf.put_u16(args.method_id);
        }
        MethodFrameArgs::ChannelCloseOk => (),
        MethodFrameArgs::ExchangeDeclare(args) => {
            buf.put_u16(0);
            encode_short_string(buf, &args.exchange_name)?;
            encode_short_string(buf, &args.exchange_type)?;
            buf.put_u8(args.flags.bits());
            encode_field_table(buf, args.args.as_ref())?;
        }
        MethodFrameArgs::ExchangeDeclareOk => (),
        MethodFrameArgs::ExchangeDelete(args) => {
            buf.put_u16(0);
            encode_short_string(buf, &args.exchange_name)?;
            buf.put_u8(args.flags.bits());
        }
        MethodFrameArgs::ExchangeDeleteOk => (),
        MethodFrameArgs::QueueDeclare(args) => {
            buf.put_u16(0);
            encode_short_string(buf, &args.name)?;
            buf.put_u8(args.flags.bits());
            encode_field_table(buf, args.args.as_ref())?;
        }
        MethodFrameArgs::QueueDeclareOk(args) => {
            encode_short_string(buf, &args.name)?;
            buf.put_u32(args.message_count);
            buf.put_u32(args.consumer_count);
        }
        MethodFrameArgs::QueueBind(args) => {
            buf.put_u16(0);
            encode_short_string(buf, &args.queue_name)?;
            encode_short_string(buf, &args.exchange_name)?;
            encode_short_string(buf, &args.routing_key)?;
            buf.put_u8(args.no_wait as u8);
            encode_field_table(buf, args.args.as_ref())?;
        }
        MethodFrameArgs::QueueBindOk => (),
        MethodFrameArgs::QueuePurge(args) => {
            buf.put_u16(0);
            encode_short_string(buf, &args.queue_name)?;
            buf.put_u8(args.no_wait as u8);
        }
        MethodFrameArgs::QueuePurgeOk(args) => buf.put_u32(args.message_count),
        MethodFrameArgs::QueueDelete(args) => {
            buf.put_u16(0);
            encode_short_string(buf, &args.queue_name)?;
            buf.put_u8(args.flags.bits());
        }
        MethodFrameArgs::QueueDeleteOk(args) => buf.put_u32(args.message_count),
        MethodFrameArgs::QueueUnbind(args) => {
            buf.put_u16(0);
            encode_short_string(buf, &args.queue_name)?;
            encode_short_string(buf, &args.exchange_name)?;
            encode_short_string(buf, &args.routing_key)?;
            encode_field_table(buf, args.args.as_ref())?;
        }
        MethodFrameArgs::QueueUnbindOk => (),
        MethodFrameArgs::BasicQos(args) => {
            buf.put_u32(args.prefetch_size);
            buf.put_u16(args.prefetch_count);
            buf.put_u8(args.global as u8);
        }
        MethodFrameArgs::BasicQosOk => (),
        MethodFrameArgs::BasicConsume(args) => {
            buf.put_u16(0);
            encode_short_string(buf, &args.queue)?;
            encode_short_string(buf, &args.consumer_tag)?;
            buf.put_u8(args.flags.bits());
            encode_field_table(buf, args.args.as_ref())?;
        }
        MethodFrameArgs::BasicConsumeOk(args) => encode_short_string(buf, &args.consumer_tag)?,
        MethodFrameArgs::BasicCancel(args) => {
            encode_short_string(buf, &args.consumer_tag)?;
            buf.put_u8(args.no_wait as u8);
        }
        MethodFrameArgs::BasicCancelOk(args) => encode_short_string(buf, &args.consumer_tag)?,
        MethodFrameArgs::BasicPublish(args) => {
            buf.put_u16(0);
            encode_short_string(buf, &args.exchange_name)?;
            encode_short_string(buf, &args.routing_key)?;
            buf.put_u8(args.flags.bits());
        }
        MethodFrameArgs::BasicReturn(args) => {
            buf.put_u16(args.reply_code);
            encode_short_string(buf, &args.reply_text)?;
            encode_short_string(buf, &args.exchange_name)?;
            encode_short_string(buf, &args.routing_key)?;
        }
        MethodFrameArgs::BasicDeliver(args) => {
            encode_short_string(buf, &args.consumer_tag)?;
            buf.put_u64(args.delivery_tag);
            buf.put_u8(args.redelivered as u8);
            encode_short_string(buf, &args.exchange_name)?;
            encode_short_string(buf, &args.routing_key)?;
        }
        MethodFrameArgs::BasicAck(args) => {
            buf.put_u64(args.delivery_tag);
            buf.put_u8(args.multiple as u8);
        }
        MethodFrameArgs::BasicReject(args) => {
            buf.put_u64(args.delivery_tag);
            buf.put_u8(args.requeue as u8);
        }
        MethodFrameArgs::BasicNack(args) => {
            buf.put_u64(args.delivery_tag);
            buf.put_u8(args.flags.bits());
        }
        MethodFrameArgs::ConfirmSelect(args) => buf.put_u8(args.no_wait as u8),
        MethodFrameArgs::ConfirmSelectOk => (),
    }

    end_frame(buf, size_pos);

    Ok(())
}

fn encode_connection_start(buf: &mut BytesMut, args: &ConnectionStartArgs) -> Result<()> {
    buf.put_u8(args.version_major);
    buf.put_u8(args.version_minor);
    encode_field_table(buf, args.properties.as_ref())?;
    encode_long_string(buf, &args.mechanisms);
    encode_long_string(buf, &args.locales);

    Ok(())
}

fn encode_connection_start_ok(buf: &mut BytesMut, args: &ConnectionStartOkArgs) -> Result<()> {
    encode_field_table(buf, args.properties.as_ref())?;
    encode_short_string(buf, &args.mechanism)?;
    encode_long_string(buf, &args.response);
    encode_short_string(buf, &args.locale)?;

    Ok(())
}

fn encode_content_header_frame(buf: &mut BytesMut, hf: &ContentHeaderFrame) -> Result<()> {
    let size_pos = begin_frame(buf, FRAME_CONTENT_HEADER, hf.channel);

    buf.put_u16(hf.class_id);
    buf.put_u16(hf.weight);
    buf.put_u64(hf.body_size);
    buf.put_u16(hf.property_flags().bits());

    if let Some(s) = &hf.content_type {
        encode_short_string(buf, s)?;
    }
    if let Some(s) = &hf.content_encoding {
        encode_short_string(buf, s)?;
    }
    if let Some(headers) = &hf.headers {
        encode_field_table(buf, Some(headers))?;
    }
    if let Some(v) = hf.delivery_mode {
        buf.put_u8(v);
    }
    if let Some(v) = hf.priority {
        buf.put_u8(v);
    }
    if let Some(s) = &hf.correlation_id {
        encode_short_string(buf, s)?;
    }
    if let Some(s) = &hf.reply_to {
        encode_short_string(buf, s)?;
    }
    if let Some(s) = &hf.expiration {
        encode_short_string(buf, s)?;
    }
    if let Some(s) = &hf.message_id {
        encode_short_string(buf, s)?;
    }
    if let Some(v) = hf.timestamp {
        buf.put_u64(v);
    }
    if let Some(s) = &hf.message_type {
        encode_short_string(buf, s)?;
    }
    if let Some(s) = &hf.user_id {
        encode_short_string(buf, s)?;
    }
    if let Some(s) = &hf.app_id {
        encode_short_string(buf, s)?;
    }
    if let Some(s) = &hf.cluster_id {
        encode_short_string(buf, s)?;
    }

    end_frame(buf, size_pos);

    Ok(())
}

fn encode_content_body_frame(buf: &mut BytesMut, bf: &ContentBodyFrame) {
    buf.reserve(bf.body.len() + FRAME_OVERHEAD);

    buf.put_u8(FRAME_CONTENT_BODY);
    buf.put_u16(bf.channel);
    buf.put_u32(bf.body.len() as u32);
    buf.put(bf.body.as_slice());
    buf.put_u8(FRAME_END);
}

fn encode_heartbeat_frame(buf: &mut BytesMut, channel: Channel) {
    buf.put_u8(FRAME_HEARTBEAT);
    buf.put_u16(channel);
    buf.put_u32(0);
    buf.put_u8(FRAME_END);
}

fn encode_short_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > u8::MAX as usize {
        return frame_error!(SYNTAX_ERROR, format!("Short string is longer than 255 bytes: {}", s.len()));
    }

    buf.put_u8(s.len() as u8);
    buf.put(s.as_bytes());

    Ok(())
}

fn encode_long_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put(s.as_bytes());
}

fn encode_field_table(buf: &mut BytesMut, ft: Option<&FieldTable>) -> Result<()> {
    let size_pos = buf.len();
    buf.put_u32(0);

    if let Some(table) = ft {
        for (name, value) in table {
            encode_short_string(buf, name)?;
            encode_value(buf, value)?;
        }
    }

    let size = (buf.len() - size_pos - 4) as u32;
    buf[size_pos..size_pos + 4].copy_from_slice(&size.to_be_bytes());

    Ok(())
}

fn encode_value(buf: &mut BytesMut, value: &AMQPFieldValue) -> Result<()> {
    match value {
        AMQPFieldValue::Bool(v) => {
            buf.put_u8(b't');
            buf.put_u8(*v as u8);
        }
        AMQPFieldValue::I8(v) => {
            buf.put_u8(b'b');
            buf.put_i8(*v);
        }
        AMQPFieldValue::U8(v) => {
            buf.put_u8(b'B');
            buf.put_u8(*v);
        }
        AMQPFieldValue::I16(v) => {
            buf.put_u8(b's');
            buf.put_i16(*v);
        }
        AMQPFieldValue::U16(v) => {
            buf.put_u8(b'u');
            buf.put_u16(*v);
        }
        AMQPFieldValue::I32(v) => {
            buf.put_u8(b'I');
            buf.put_i32(*v);
        }
        AMQPFieldValue::U32(v) => {
            buf.put_u8(b'i');
            buf.put_u32(*v);
        }
        AMQPFieldValue::I64(v) => {
            buf.put_u8(b'l');
            buf.put_i64(*v);
        }
        AMQPFieldValue::F32(v) => {
            buf.put_u8(b'f');
            buf.put_f32(*v);
        }
        AMQPFieldValue::F64(v) => {
            buf.put_u8(b'd');
            buf.put_f64(*v);
        }
        AMQPFieldValue::Decimal(scale, v) => {
            buf.put_u8(b'D');
            buf.put_u8(*scale);
            buf.put_u32(*v);
        }
        AMQPFieldValue::LongString(v) => {
            buf.put_u8(b'S');
            encode_long_string(buf, v);
        }
        AMQPFieldValue::Timestamp(v) => {
            buf.put_u8(b'T');
            buf.put_u64(*v);
        }
        AMQPFieldValue::FieldTable(v) => {
            buf.put_u8(b'F');
            encode_field_table(buf, Some(v))?;
        }
        AMQPFieldValue::FieldArray(values) => {
            buf.put_u8(b'A');

            let size_pos = buf.len();
            buf.put_u32(0);

            for v in values {
                encode_value(buf, v)?;
            }

            let size = (buf.len() - size_pos - 4) as u32;
            buf[size_pos..size_pos + 4].copy_from_slice(&size.to_be_bytes());
        }
        AMQPFieldValue::ByteArray(v) => {
            buf.put_u8(b'x');
            buf.put_u32(v.len() as u32);
            buf.put(v.as_slice());
        }
        AMQPFieldValue::Void => buf.put_u8(b'V'),
    }

    Ok(())
}
