use crate::channel::ChannelId;

/// One registered interest in a topic, tied to the channel that receives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    topic: String,
    channel_id: ChannelId,
    active: bool,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, channel_id: ChannelId) -> Self {
        Self {
            topic: topic.into(),
            channel_id,
            active: true,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }
}
