/// Identity prefix reserved for automated agents.
///
/// An agent session subscribes itself to every channel it learns about,
/// instead of waiting for explicit subscribe commands.
pub const AGENT_PREFIX: &str = "bot-";

/// The authenticated identity for the remainder of the process lifetime.
///
/// Populated exactly once from a successful login reply; there is no
/// logout. The listener task holds a shared reference for its prompt text
/// and its default direct-message topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: String,
    pub token: String,
    pub is_agent: bool,
}

impl Session {
    pub fn new(identity: String, token: String) -> Self {
        let is_agent = identity.starts_with(AGENT_PREFIX);
        Self {
            identity,
            token,
            is_agent,
        }
    }
}
