use serde::Deserialize;

/// Actions a notification client can send over the push channel.
///
/// Unknown actions deserialize to `Unknown` so the server can answer with
/// an `error` frame instead of dropping the connection.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    SubscribeTopic {
        topic: String,
    },
    SubscribeConsumerGroup {
        #[serde(rename = "consumerGroup")]
        consumer_group: String,
    },
    Unsubscribe,
    Ping,
    #[serde(other)]
    Unknown,
}
