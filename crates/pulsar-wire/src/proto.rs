//! Pulsar `BaseCommand` vocabulary, protocol v12.
//!
//! Hand-maintained prost structs for the subset of commands this client
//! speaks. Field numbers follow the upstream `PulsarApi.proto`; every field
//! is modeled with explicit presence (proto2), so encoded output always
//! carries a field that was set, even when it equals the type default.

/// Protocol version this client negotiates in CONNECT.
pub const PROTOCOL_VERSION: i32 = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum CommandType {
    Connect = 2,
    Connected = 3,
    Subscribe = 4,
    Producer = 5,
    Send = 6,
    SendReceipt = 7,
    SendError = 8,
    Message = 9,
    Ack = 10,
    Flow = 11,
    Unsubscribe = 12,
    Success = 13,
    Error = 14,
    CloseProducer = 15,
    CloseConsumer = 16,
    ProducerSuccess = 17,
    Ping = 18,
    Pong = 19,
    RedeliverUnacknowledgedMessages = 20,
    PartitionedMetadata = 21,
    PartitionedMetadataResponse = 22,
    Lookup = 23,
    LookupResponse = 24,
    ConsumerStats = 25,
    ConsumerStatsResponse = 26,
    ReachedEndOfTopic = 27,
    Seek = 28,
    GetLastMessageId = 29,
    GetLastMessageIdResponse = 30,
    ActiveConsumerChange = 31,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ServerError {
    UnknownError = 0,
    MetadataError = 1,
    PersistenceError = 2,
    AuthenticationError = 3,
    AuthorizationError = 4,
    ConsumerBusy = 5,
    ServiceNotReady = 6,
    ProducerBlockedQuotaExceededError = 7,
    ProducerBlockedQuotaExceededException = 8,
    ChecksumError = 9,
    UnsupportedVersionError = 10,
    TopicNotFound = 11,
    SubscriptionNotFound = 12,
    ConsumerNotFound = 13,
    TooManyRequests = 14,
    TopicTerminatedError = 15,
    ProducerBusy = 16,
    InvalidTopicName = 17,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum CompressionType {
    None = 0,
    Lz4 = 1,
    Zlib = 2,
    Zstd = 3,
    Snappy = 4,
}

/// Subscription type carried in SUBSCRIBE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum SubType {
    Exclusive = 0,
    Shared = 1,
    Failover = 2,
}

/// Cursor position for a fresh subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum InitialPosition {
    Latest = 0,
    Earliest = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum AckType {
    Individual = 0,
    Cumulative = 1,
}

/// Outcome of a LOOKUP round trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum LookupType {
    Redirect = 0,
    Connect = 1,
    Failed = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum PartitionedResponse {
    Success = 0,
    Failed = 1,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct KeyValue {
    #[prost(string, optional, tag = "1")]
    pub key: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub value: Option<String>,
}

/// Durable address of a message: (ledger, entry, partition, batch-index).
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct MessageIdData {
    #[prost(uint64, optional, tag = "1")]
    pub ledger_id: Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub entry_id: Option<u64>,
    #[prost(int32, optional, tag = "3")]
    pub partition: Option<i32>,
    #[prost(int32, optional, tag = "4")]
    pub batch_index: Option<i32>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct MessageMetadata {
    #[prost(string, optional, tag = "1")]
    pub producer_name: Option<String>,
    #[prost(uint64, optional, tag = "2")]
    pub sequence_id: Option<u64>,
    /// Wall-clock publish time in epoch milliseconds.
    #[prost(uint64, optional, tag = "3")]
    pub publish_time: Option<u64>,
    #[prost(message, repeated, tag = "4")]
    pub properties: Vec<KeyValue>,
    #[prost(string, optional, tag = "6")]
    pub partition_key: Option<String>,
    #[prost(enumeration = "CompressionType", optional, tag = "7")]
    pub compression: Option<i32>,
    #[prost(uint32, optional, tag = "8")]
    pub uncompressed_size: Option<u32>,
    /// When set, the payload is a batch container of this many entries.
    #[prost(int32, optional, tag = "9")]
    pub num_messages_in_batch: Option<i32>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct SingleMessageMetadata {
    #[prost(message, repeated, tag = "1")]
    pub properties: Vec<KeyValue>,
    #[prost(string, optional, tag = "2")]
    pub partition_key: Option<String>,
    #[prost(int32, optional, tag = "3")]
    pub payload_size: Option<i32>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandConnect {
    #[prost(string, optional, tag = "1")]
    pub client_version: Option<String>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub auth_data: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "4")]
    pub protocol_version: Option<i32>,
    #[prost(string, optional, tag = "5")]
    pub auth_method_name: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub proxy_to_broker_url: Option<String>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandConnected {
    #[prost(string, optional, tag = "1")]
    pub server_version: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub protocol_version: Option<i32>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandSubscribe {
    #[prost(string, optional, tag = "1")]
    pub topic: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub subscription: Option<String>,
    #[prost(enumeration = "SubType", optional, tag = "3")]
    pub sub_type: Option<i32>,
    #[prost(uint64, optional, tag = "4")]
    pub consumer_id: Option<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub request_id: Option<u64>,
    #[prost(string, optional, tag = "6")]
    pub consumer_name: Option<String>,
    #[prost(enumeration = "InitialPosition", optional, tag = "13")]
    pub initial_position: Option<i32>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandProducer {
    #[prost(string, optional, tag = "1")]
    pub topic: Option<String>,
    #[prost(uint64, optional, tag = "2")]
    pub producer_id: Option<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub request_id: Option<u64>,
    #[prost(string, optional, tag = "4")]
    pub producer_name: Option<String>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandProducerSuccess {
    #[prost(uint64, optional, tag = "1")]
    pub request_id: Option<u64>,
    #[prost(string, optional, tag = "2")]
    pub producer_name: Option<String>,
    #[prost(int64, optional, tag = "3")]
    pub last_sequence_id: Option<i64>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandSend {
    #[prost(uint64, optional, tag = "1")]
    pub producer_id: Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub sequence_id: Option<u64>,
    #[prost(int32, optional, tag = "3")]
    pub num_messages: Option<i32>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandSendReceipt {
    #[prost(uint64, optional, tag = "1")]
    pub producer_id: Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub sequence_id: Option<u64>,
    #[prost(message, optional, tag = "3")]
    pub message_id: Option<MessageIdData>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandSendError {
    #[prost(uint64, optional, tag = "1")]
    pub producer_id: Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub sequence_id: Option<u64>,
    #[prost(enumeration = "ServerError", optional, tag = "3")]
    pub error: Option<i32>,
    #[prost(string, optional, tag = "4")]
    pub message: Option<String>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandMessage {
    #[prost(uint64, optional, tag = "1")]
    pub consumer_id: Option<u64>,
    #[prost(message, optional, tag = "2")]
    pub message_id: Option<MessageIdData>,
    #[prost(uint32, optional, tag = "3")]
    pub redelivery_count: Option<u32>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandAck {
    #[prost(uint64, optional, tag = "1")]
    pub consumer_id: Option<u64>,
    #[prost(enumeration = "AckType", optional, tag = "2")]
    pub ack_type: Option<i32>,
    #[prost(message, repeated, tag = "3")]
    pub message_id: Vec<MessageIdData>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandFlow {
    #[prost(uint64, optional, tag = "1")]
    pub consumer_id: Option<u64>,
    #[prost(uint32, optional, tag = "2")]
    pub message_permits: Option<u32>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandUnsubscribe {
    #[prost(uint64, optional, tag = "1")]
    pub consumer_id: Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub request_id: Option<u64>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandSuccess {
    #[prost(uint64, optional, tag = "1")]
    pub request_id: Option<u64>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandError {
    #[prost(uint64, optional, tag = "1")]
    pub request_id: Option<u64>,
    #[prost(enumeration = "ServerError", optional, tag = "2")]
    pub error: Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub message: Option<String>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandCloseProducer {
    #[prost(uint64, optional, tag = "1")]
    pub producer_id: Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub request_id: Option<u64>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandCloseConsumer {
    #[prost(uint64, optional, tag = "1")]
    pub consumer_id: Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub request_id: Option<u64>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandPing {}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandPong {}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandRedeliverUnacknowledgedMessages {
    #[prost(uint64, optional, tag = "1")]
    pub consumer_id: Option<u64>,
    #[prost(message, repeated, tag = "2")]
    pub message_ids: Vec<MessageIdData>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandPartitionedTopicMetadata {
    #[prost(string, optional, tag = "1")]
    pub topic: Option<String>,
    #[prost(uint64, optional, tag = "2")]
    pub request_id: Option<u64>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandPartitionedTopicMetadataResponse {
    #[prost(uint32, optional, tag = "1")]
    pub partitions: Option<u32>,
    #[prost(uint64, optional, tag = "2")]
    pub request_id: Option<u64>,
    #[prost(enumeration = "PartitionedResponse", optional, tag = "3")]
    pub response: Option<i32>,
    #[prost(enumeration = "ServerError", optional, tag = "4")]
    pub error: Option<i32>,
    #[prost(string, optional, tag = "5")]
    pub message: Option<String>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandLookupTopic {
    #[prost(string, optional, tag = "1")]
    pub topic: Option<String>,
    #[prost(uint64, optional, tag = "2")]
    pub request_id: Option<u64>,
    #[prost(bool, optional, tag = "3")]
    pub authoritative: Option<bool>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandLookupTopicResponse {
    #[prost(string, optional, tag = "1")]
    pub broker_service_url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub broker_service_url_tls: Option<String>,
    #[prost(enumeration = "LookupType", optional, tag = "3")]
    pub response: Option<i32>,
    #[prost(uint64, optional, tag = "4")]
    pub request_id: Option<u64>,
    #[prost(bool, optional, tag = "5")]
    pub authoritative: Option<bool>,
    #[prost(enumeration = "ServerError", optional, tag = "6")]
    pub error: Option<i32>,
    #[prost(string, optional, tag = "7")]
    pub message: Option<String>,
    #[prost(bool, optional, tag = "8")]
    pub proxy_through_service_url: Option<bool>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandReachedEndOfTopic {
    #[prost(uint64, optional, tag = "1")]
    pub consumer_id: Option<u64>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandSeek {
    #[prost(uint64, optional, tag = "1")]
    pub consumer_id: Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub request_id: Option<u64>,
    #[prost(message, optional, tag = "3")]
    pub message_id: Option<MessageIdData>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommandActiveConsumerChange {
    #[prost(uint64, optional, tag = "1")]
    pub consumer_id: Option<u64>,
    #[prost(bool, optional, tag = "2")]
    pub is_active: Option<bool>,
}

/// Tagged union over the command vocabulary. Exactly one sub-message is
/// populated, matching `type`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BaseCommand {
    #[prost(enumeration = "CommandType", optional, tag = "1")]
    pub r#type: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub connect: Option<CommandConnect>,
    #[prost(message, optional, tag = "3")]
    pub connected: Option<CommandConnected>,
    #[prost(message, optional, tag = "4")]
    pub subscribe: Option<CommandSubscribe>,
    #[prost(message, optional, tag = "5")]
    pub producer: Option<CommandProducer>,
    #[prost(message, optional, tag = "6")]
    pub send: Option<CommandSend>,
    #[prost(message, optional, tag = "7")]
    pub send_receipt: Option<CommandSendReceipt>,
    #[prost(message, optional, tag = "8")]
    pub send_error: Option<CommandSendError>,
    #[prost(message, optional, tag = "9")]
    pub message: Option<CommandMessage>,
    #[prost(message, optional, tag = "10")]
    pub ack: Option<CommandAck>,
    #[prost(message, optional, tag = "11")]
    pub flow: Option<CommandFlow>,
    #[prost(message, optional, tag = "12")]
    pub unsubscribe: Option<CommandUnsubscribe>,
    #[prost(message, optional, tag = "13")]
    pub success: Option<CommandSuccess>,
    #[prost(message, optional, tag = "14")]
    pub error: Option<CommandError>,
    #[prost(message, optional, tag = "15")]
    pub close_producer: Option<CommandCloseProducer>,
    #[prost(message, optional, tag = "16")]
    pub close_consumer: Option<CommandCloseConsumer>,
    #[prost(message, optional, tag = "17")]
    pub producer_success: Option<CommandProducerSuccess>,
    #[prost(message, optional, tag = "18")]
    pub ping: Option<CommandPing>,
    #[prost(message, optional, tag = "19")]
    pub pong: Option<CommandPong>,
    #[prost(message, optional, tag = "20")]
    pub redeliver_unacknowledged_messages: Option<CommandRedeliverUnacknowledgedMessages>,
    #[prost(message, optional, tag = "21")]
    pub partition_metadata: Option<CommandPartitionedTopicMetadata>,
    #[prost(message, optional, tag = "22")]
    pub partition_metadata_response: Option<CommandPartitionedTopicMetadataResponse>,
    #[prost(message, optional, tag = "23")]
    pub lookup_topic: Option<CommandLookupTopic>,
    #[prost(message, optional, tag = "24")]
    pub lookup_topic_response: Option<CommandLookupTopicResponse>,
    #[prost(message, optional, tag = "27")]
    pub reached_end_of_topic: Option<CommandReachedEndOfTopic>,
    #[prost(message, optional, tag = "28")]
    pub seek: Option<CommandSeek>,
    #[prost(message, optional, tag = "31")]
    pub active_consumer_change: Option<CommandActiveConsumerChange>,
}

impl BaseCommand {
    /// Empty command of the given type; callers fill in the matching
    /// sub-message.
    pub fn of(kind: CommandType) -> Self {
        Self {
            r#type: Some(kind as i32),
            ..Self::default()
        }
    }

    /// Decoded command type, or `None` for vocabulary this client does not
    /// know (callers log and drop such frames).
    pub fn command_type(&self) -> Option<CommandType> {
        self.r#type.and_then(|raw| CommandType::try_from(raw).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn base_command_round_trips_through_protobuf() {
        let mut cmd = BaseCommand::of(CommandType::Send);
        cmd.send = Some(CommandSend {
            producer_id: Some(0),
            sequence_id: Some(0),
            num_messages: Some(1),
        });
        let bytes = cmd.encode_to_vec();
        let decoded = BaseCommand::decode(bytes.as_slice()).expect("decode");
        assert_eq!(decoded, cmd);
        assert_eq!(decoded.command_type(), Some(CommandType::Send));
    }

    #[test]
    fn explicit_presence_encodes_zero_valued_fields() {
        // producer_id=0 and sequence_id=0 must survive the wire; a fresh
        // producer's first SEND uses exactly these values.
        let send = CommandSend {
            producer_id: Some(0),
            sequence_id: Some(0),
            num_messages: None,
        };
        let bytes = send.encode_to_vec();
        assert!(!bytes.is_empty());
        let decoded = CommandSend::decode(bytes.as_slice()).expect("decode");
        assert_eq!(decoded.producer_id, Some(0));
        assert_eq!(decoded.sequence_id, Some(0));
        assert_eq!(decoded.num_messages, None);
    }

    #[test]
    fn unknown_command_type_is_none() {
        let cmd = BaseCommand {
            r#type: Some(9999),
            ..BaseCommand::default()
        };
        assert_eq!(cmd.command_type(), None);
    }
}
