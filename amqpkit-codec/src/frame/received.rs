//! Arguments of the channel level methods only the server sends. The client decodes them, so
//! they carry no constructors.

#[derive(Clone, Debug, Default)]
pub struct QueueDeclareOkArgs {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Clone, Debug, Default)]
pub struct QueuePurgeOkArgs {
    pub message_count: u32,
}

#[derive(Clone, Debug, Default)]
pub struct QueueDeleteOkArgs {
    pub message_count: u32,
}

#[derive(Clone, Debug, Default)]
pub struct BasicConsumeOkArgs {
    pub consumer_tag: String,
}

#[derive(Clone, Debug, Default)]
pub struct BasicReturnArgs {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange_name: String,
    pub routing_key: String,
}

#[derive(Clone, Debug, Default)]
pub struct BasicDeliverArgs {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange_name: String,
    pub routing_key: String,
}
