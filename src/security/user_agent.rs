//! User-Agent policy: makes automated clients visible, optionally blocks them.

pub const AUTOMATED_RULE: &str = "user-agent.automated";

#[derive(Debug, Clone, Default)]
pub struct UserAgentPolicy {
    signatures: Vec<String>,
    block: bool,
}

impl UserAgentPolicy {
    pub fn new(signatures: &[String], block: bool) -> Self {
        Self {
            signatures: signatures
                .iter()
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            block,
        }
    }

    /// The first configured signature found in `user_agent`, if any.
    pub fn automated_signature(&self, user_agent: &str) -> Option<&str> {
        let user_agent = user_agent.to_ascii_lowercase();
        self.signatures
            .iter()
            .find(|signature| user_agent.contains(signature.as_str()))
            .map(String::as_str)
    }

    pub fn blocks(&self) -> bool {
        self.block
    }
}
