//! A bayeux channel.

use serde_json::Value;

/// A named topic: subscribers receive every event published to it,
/// and publishes from clients are handed to the channel object.
pub trait Channel: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// A client published `message` to this channel; `output` starts
    /// as the reply `"OK"` and may be replaced.
    fn handle_event(&self, _message: &Value, _output: &mut Value) {}
}

/// A channel that does nothing with published events; fan-out to
/// subscribers still works through the module.
pub struct PlainChannel {
    name: String,
}

impl PlainChannel {
    pub fn new(name: &str) -> PlainChannel {
        PlainChannel { name: name.to_string() }
    }
}

impl Channel for PlainChannel {
    fn name(&self) -> &str {
        &self.name
    }
}
