use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Trigger phrase must not be empty")]
pub struct EmptyTrigger;

/// Validated, lowercased trigger phrase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerPhrase(String);

impl TriggerPhrase {
    pub fn new(phrase: &str) -> Result<Self, EmptyTrigger> {
        if phrase.trim().is_empty() {
            return Err(EmptyTrigger);
        }
        Ok(Self(phrase.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_in(&self, payload_text: &str) -> bool {
        !payload_text.is_empty() && payload_text.to_lowercase().contains(&self.0)
    }
}

/// Case-insensitive substring match. An empty phrase never matches here;
/// configuration rejects it before the bridge starts.
pub fn matches(payload_text: &str, trigger_phrase: &str) -> bool {
    TriggerPhrase::new(trigger_phrase)
        .map(|trigger| trigger.is_in(payload_text))
        .unwrap_or(false)
}
