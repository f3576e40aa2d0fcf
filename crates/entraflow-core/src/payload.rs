use serde::{Deserialize, Serialize};

/// Opaque result produced by an agent.
///
/// The core stores payloads and hands them to dependents but never interprets
/// them, with one exception: conditional edges read a single field through
/// [`Payload::field`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(serde_json::Value);

impl Payload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn empty() -> Self {
        Self(serde_json::Value::Object(Default::default()))
    }

    /// Look up a dotted path (`sentiment.news.score`, `items.0`).
    ///
    /// Numeric segments index into arrays. An empty path returns the whole
    /// payload.
    pub fn field(&self, path: &str) -> Option<&serde_json::Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.0);
        }
        path.split('.').try_fold(&self.0, |current, segment| match current {
            serde_json::Value::Object(map) => map.get(segment),
            serde_json::Value::Array(items) => {
                segment.parse::<usize>().ok().and_then(|i| items.get(i))
            }
            _ => None,
        })
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}
