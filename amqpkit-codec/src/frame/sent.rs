//! Arguments of the channel level methods the client sends. Some of them travel the other way,
//! too: the server cancels consumers, confirms publishes and closes or throttles channels.
//!
//! Flag sets are built by the caller, the structs are plain data.

use super::{split_class_method, unify_class_method, AMQPFrame, Channel, ClassMethod, FieldTable, MethodFrameArgs};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct ExchangeDeclareFlags: u8 {
        const PASSIVE = 0b00000001;
        const DURABLE = 0b00000010;
        const AUTO_DELETE = 0b00000100;
        const INTERNAL = 0b00001000;
        const NO_WAIT = 0b00010000;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct ExchangeDeleteFlags: u8 {
        const IF_UNUSED = 0b00000001;
        const NO_WAIT = 0b00000010;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct QueueDeclareFlags: u8 {
        const PASSIVE = 0b00000001;
        const DURABLE = 0b00000010;
        const EXCLUSIVE = 0b00000100;
        const AUTO_DELETE = 0b00001000;
        const NO_WAIT = 0b00010000;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct QueueDeleteFlags: u8 {
        const IF_UNUSED = 0b00000001;
        const IF_EMPTY = 0b00000010;
        const NO_WAIT = 0b00000100;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct BasicConsumeFlags: u8 {
        const NO_LOCAL = 0b00000001;
        const NO_ACK = 0b00000010;
        const EXCLUSIVE = 0b00000100;
        const NO_WAIT = 0b00001000;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct BasicPublishFlags: u8 {
        const MANDATORY = 0b00000001;
        const IMMEDIATE = 0b00000010;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct BasicNackFlags: u8 {
        const MULTIPLE = 0b00000001;
        const REQUEUE = 0b00000010;
    }
}

#[derive(Clone, Debug, Default)]
pub struct ChannelCloseArgs {
    pub code: u16,
    pub text: String,
    pub class_id: u16,
    pub method_id: u16,
}

impl ChannelCloseArgs {
    pub fn new(code: u16, text: &str) -> Self {
        Self {
            code,
            text: text.to_string(),
            ..Default::default()
        }
    }

    /// The method which caused the close, 0 if there is no such method.
    pub fn class_method(&self) -> ClassMethod {
        unify_class_method(self.class_id, self.method_id)
    }
}

/// Argument of both `Channel.Flow` and `Channel.FlowOk`.
#[derive(Clone, Debug, Default)]
pub struct ChannelFlowArgs {
    pub active: bool,
}

impl ChannelFlowArgs {
    pub fn new(active: bool) -> Self {
        Self { active }
    }

    pub fn ok_frame(self, channel: Channel) -> AMQPFrame {
        AMQPFrame::Method(channel, super::CHANNEL_FLOW_OK, MethodFrameArgs::ChannelFlowOk(self))
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExchangeDeclareArgs {
    pub exchange_name: String,
    pub exchange_type: String,
    pub flags: ExchangeDeclareFlags,
    pub args: Option<FieldTable>,
}

#[derive(Clone, Debug, Default)]
pub struct ExchangeDeleteArgs {
    pub exchange_name: String,
    pub flags: ExchangeDeleteFlags,
}

#[derive(Clone, Debug, Default)]
pub struct QueueDeclareArgs {
    pub name: String,
    pub flags: QueueDeclareFlags,
    pub args: Option<FieldTable>,
}

#[derive(Clone, Debug, Default)]
pub struct QueueBindArgs {
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
    pub no_wait: bool,
    pub args: Option<FieldTable>,
}

#[derive(Clone, Debug, Default)]
pub struct QueueUnbindArgs {
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
    pub args: Option<FieldTable>,
}

#[derive(Clone, Debug, Default)]
pub struct QueuePurgeArgs {
    pub queue_name: String,
    pub no_wait: bool,
}

#[derive(Clone, Debug, Default)]
pub struct QueueDeleteArgs {
    pub queue_name: String,
    pub flags: QueueDeleteFlags,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BasicQosArgs {
    pub prefetch_size: u32,
    pub prefetch_count: u16,
    pub global: bool,
}

#[derive(Clone, Debug, Default)]
pub struct BasicConsumeArgs {
    pub queue: String,
    pub consumer_tag: String,
    pub flags: BasicConsumeFlags,
    pub args: Option<FieldTable>,
}

impl BasicConsumeArgs {
    pub fn is_no_ack(&self) -> bool {
        self.flags.contains(BasicConsumeFlags::NO_ACK)
    }
}

/// Argument of both `Basic.Cancel` and `Basic.CancelOk`, the latter never has `no_wait`.
#[derive(Clone, Debug, Default)]
pub struct BasicCancelArgs {
    pub consumer_tag: String,
    pub no_wait: bool,
}

#[derive(Clone, Debug, Default)]
pub struct BasicCancelOkArgs {
    pub consumer_tag: String,
}

#[derive(Clone, Debug, Default)]
pub struct BasicPublishArgs {
    pub exchange_name: String,
    pub routing_key: String,
    pub flags: BasicPublishFlags,
}

impl BasicPublishArgs {
    pub fn is_mandatory(&self) -> bool {
        self.flags.contains(BasicPublishFlags::MANDATORY)
    }
}

#[derive(Clone, Debug, Default)]
pub struct BasicAckArgs {
    pub delivery_tag: u64,
    pub multiple: bool,
}

#[derive(Clone, Debug, Default)]
pub struct BasicRejectArgs {
    pub delivery_tag: u64,
    pub requeue: bool,
}

#[derive(Clone, Debug, Default)]
pub struct BasicNackArgs {
    pub delivery_tag: u64,
    pub flags: BasicNackFlags,
}

impl BasicNackArgs {
    pub fn is_multiple(&self) -> bool {
        self.flags.contains(BasicNackFlags::MULTIPLE)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfirmSelectArgs {
    pub no_wait: bool,
}

pub fn channel_open(channel: Channel) -> AMQPFrame {
    AMQPFrame::Method(channel, super::CHANNEL_OPEN, MethodFrameArgs::ChannelOpen)
}

pub fn channel_close(channel: Channel, code: u16, text: &str, class_method: ClassMethod) -> AMQPFrame {
    let (class_id, method_id) = split_class_method(class_method);

    ChannelCloseArgs {
        code,
        text: text.to_string(),
        class_id,
        method_id,
    }
    .frame(channel)
}

pub fn channel_close_ok(channel: Channel) -> AMQPFrame {
    AMQPFrame::Method(channel, super::CHANNEL_CLOSE_OK, MethodFrameArgs::ChannelCloseOk)
}

pub fn confirm_select(channel: Channel) -> AMQPFrame {
    ConfirmSelectArgs::default().frame(channel)
}
