pub mod client;
pub mod topics;

/// A message queued for the broker by the command path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
}
