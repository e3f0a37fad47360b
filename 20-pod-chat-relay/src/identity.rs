use std::{fmt, sync::Arc};

/// Environment value the pod name is read from.
pub const POD_NAME_ENV: &str = "podname";

/// Display name used when the pod name is missing.
pub const UNKNOWN_POD_NAME: &str = "Unknown Pod Name";

/// Name of the pod this process runs as, resolved once at startup.
///
/// The display form is shown on the chat page. The topic form is the same
/// string with every character Kafka does not allow in topic names replaced
/// by `_`, so a well-formed pod name is its own topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodIdentity {
    name: Arc<str>,
    topic: Arc<str>,
}

impl PodIdentity {
    /// Builds the identity from a raw value; empty or missing values fall back
    /// to [`UNKNOWN_POD_NAME`].
    pub fn resolve(raw: Option<&str>) -> Self {
        let name = raw
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_POD_NAME);

        let topic: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        Self {
            name: Arc::from(name),
            topic: Arc::from(topic),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_blank_name_uses_sentinel() {
        assert_eq!(PodIdentity::resolve(None).name(), UNKNOWN_POD_NAME);
        assert_eq!(PodIdentity::resolve(Some("   ")).name(), UNKNOWN_POD_NAME);
        assert_eq!(PodIdentity::resolve(None).topic(), "Unknown_Pod_Name");
    }

    #[test]
    fn pod_names_are_their_own_topic() {
        let identity = PodIdentity::resolve(Some("chat-7d9f8b6c5-x2x4q"));
        assert_eq!(identity.name(), "chat-7d9f8b6c5-x2x4q");
        assert_eq!(identity.topic(), "chat-7d9f8b6c5-x2x4q");
    }

    #[test]
    fn invalid_topic_characters_are_replaced() {
        let identity = PodIdentity::resolve(Some("pod/one:two"));
        assert_eq!(identity.name(), "pod/one:two");
        assert_eq!(identity.topic(), "pod_one_two");
    }
}
