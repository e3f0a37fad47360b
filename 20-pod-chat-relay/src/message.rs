use std::fmt;

/// One frame read from a client socket, reduced to what the relay acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Close,
}

/// Client input ready for publication.
///
/// Every `\n` becomes a single space and surrounding whitespace is trimmed,
/// so one published record is one line in the chat log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage(String);

impl RelayMessage {
    pub fn normalize(raw: &str) -> Self {
        Self(raw.replace('\n', " ").trim().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for RelayMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
