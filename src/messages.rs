/// Commands accepted from Home Assistant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MowerCommand {
    StartMowing,
    Pause,
    Dock,
}

impl MowerCommand {
    pub const ALL: [MowerCommand; 3] = [
        MowerCommand::StartMowing,
        MowerCommand::Pause,
        MowerCommand::Dock,
    ];

    /// Last segment of the command topic.
    pub fn topic_suffix(&self) -> &'static str {
        match self {
            MowerCommand::StartMowing => "start_mowing",
            MowerCommand::Pause => "pause",
            MowerCommand::Dock => "dock",
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        let suffix = topic.rsplit('/').next()?;
        Self::ALL
            .into_iter()
            .find(|command| command.topic_suffix() == suffix)
    }
}

/// What the MQTT event loop hands to the manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MqttAnnouncement {
    Command(MowerCommand),
    /// Home Assistant came back online and needs fresh state.
    HomeAssistantOnline,
}

/// Sent to subscribers once per completed refresh cycle. Carries no device data;
/// subscribers read the coordinator for that.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateNotice {
    Updated,
    Failed(/* reason */ String),
    /// The link dropped between cycles.
    Disconnected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated,
    Failed(/* reason */ String),
    /// Another cycle was already in flight.
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_from_topic() {
        assert_eq!(
            MowerCommand::from_topic("automower/garden/start_mowing"),
            Some(MowerCommand::StartMowing)
        );
        assert_eq!(
            MowerCommand::from_topic("automower/garden/dock"),
            Some(MowerCommand::Dock)
        );
        assert_eq!(MowerCommand::from_topic("automower/garden/state"), None);
    }
}
