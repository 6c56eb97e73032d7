// Logical addressing patterns and their canonical subject form.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Option key selecting a competing-consumer group for a subscription.
pub const OPT_QUEUE_GROUP: &str = "queue_group";
/// Option key naming a durable consumer on transports that support one.
pub const OPT_DURABLE: &str = "durable";

/// Logical address a handler is registered under.
///
/// A literal pattern is used verbatim as the registry key. A scoped pattern
/// carries delivery options and canonicalizes deterministically, so two
/// descriptors with the same fields always collide in the registry no matter
/// the order their options were inserted in.
///
/// ```
/// use tether_wire::Pattern;
///
/// let literal = Pattern::from("math.sum");
/// assert_eq!(literal.canonical(), "math.sum");
///
/// let scoped = Pattern::with_queue_group("work.item", "workers");
/// assert_eq!(scoped.queue_group(), Some("workers"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Pattern {
    /// Bare subject string, passed through unchanged.
    Literal(String),
    /// Subject plus delivery options.
    Scoped {
        subject: String,
        options: BTreeMap<String, String>,
    },
}

impl Pattern {
    pub fn literal(subject: impl Into<String>) -> Self {
        Pattern::Literal(subject.into())
    }

    pub fn scoped(subject: impl Into<String>, options: BTreeMap<String, String>) -> Self {
        Pattern::Scoped {
            subject: subject.into(),
            options,
        }
    }

    /// Scoped pattern carrying only a queue group.
    pub fn with_queue_group(subject: impl Into<String>, group: impl Into<String>) -> Self {
        let mut options = BTreeMap::new();
        options.insert(OPT_QUEUE_GROUP.to_string(), group.into());
        Pattern::Scoped {
            subject: subject.into(),
            options,
        }
    }

    pub fn subject(&self) -> &str {
        match self {
            Pattern::Literal(subject) => subject,
            Pattern::Scoped { subject, .. } => subject,
        }
    }

    pub fn queue_group(&self) -> Option<&str> {
        match self {
            Pattern::Literal(_) => None,
            Pattern::Scoped { options, .. } => options.get(OPT_QUEUE_GROUP).map(String::as_str),
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        match self {
            Pattern::Literal(_) => None,
            Pattern::Scoped { options, .. } => options.get(key).map(String::as_str),
        }
    }

    /// Stable registry key for this pattern. Total and pure.
    ///
    /// Literals pass through byte for byte. Scoped patterns render as a
    /// compact JSON object whose options map is ordered, so structurally
    /// equal descriptors always produce the same key. A scoped pattern with
    /// empty options is still distinct from the literal of the same subject.
    pub fn canonical(&self) -> String {
        match self {
            Pattern::Literal(subject) => subject.clone(),
            Pattern::Scoped { subject, options } => {
                // BTreeMap iteration is sorted; insertion order cannot leak
                // into the key.
                serde_json::json!({
                    "options": options,
                    "subject": subject,
                })
                .to_string()
            }
        }
    }
}

impl From<&str> for Pattern {
    fn from(subject: &str) -> Self {
        Pattern::Literal(subject.to_string())
    }
}

impl From<String> for Pattern {
    fn from(subject: String) -> Self {
        Pattern::Literal(subject)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}
