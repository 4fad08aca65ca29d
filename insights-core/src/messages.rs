//! Schema-tagged message envelopes.
//!
//! Every queue body is an [`Envelope`] naming the schema and version of its
//! payload, so the dispatcher can route it to a strongly typed handler and
//! reject anything it does not understand.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{error::Result, queue::QueueKind};

/// A typed queue message.
pub trait Message: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable routing name stored in the envelope.
    const SCHEMA: &'static str;
    const VERSION: u32 = 1;
    /// Queue the message travels on.
    const QUEUE: QueueKind;

    /// Messages sharing a key are kept in the same batch where possible.
    fn batch_key(&self) -> Option<String> {
        None
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "k", rename_all = "snake_case")]
pub enum Envelope {
    Single {
        #[serde(rename = "n")]
        schema: String,
        #[serde(rename = "v")]
        version: u32,
        #[serde(rename = "d")]
        data: Value,
    },
    Batch {
        #[serde(rename = "n")]
        schema: String,
        #[serde(rename = "v")]
        version: u32,
        #[serde(rename = "d")]
        data: Vec<Value>,
    },
}

impl Envelope {
    pub fn single<M: Message>(message: &M) -> Result<Self> {
        Ok(Envelope::Single {
            schema: M::SCHEMA.to_owned(),
            version: M::VERSION,
            data: serde_json::to_value(message)?,
        })
    }

    pub fn batch<M: Message>(messages: &[M]) -> Result<Self> {
        Ok(Envelope::Batch {
            schema: M::SCHEMA.to_owned(),
            version: M::VERSION,
            data: messages
                .iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<_, _>>()?,
        })
    }

    pub fn parse(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn to_body(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn schema(&self) -> &str {
        match self {
            Envelope::Single { schema, .. } | Envelope::Batch { schema, .. } => schema,
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            Envelope::Single { version, .. } | Envelope::Batch { version, .. } => *version,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Envelope::Single { .. } => 1,
            Envelope::Batch { data, .. } => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Message for Ping {
        const SCHEMA: &'static str = "ping";
        const VERSION: u32 = 2;
        const QUEUE: QueueKind = QueueKind::Work;
    }

    #[test]
    fn envelope_wire_format_is_compact() {
        let body = Envelope::single(&Ping { n: 7 })
            .expect("single")
            .to_body()
            .expect("body");
        assert_eq!(body, r#"{"k":"single","n":"ping","v":2,"d":{"n":7}}"#);

        let parsed = Envelope::parse(r#"{"k":"batch","n":"ping","v":2,"d":[{"n":1},{"n":2}]}"#)
            .expect("parse batch");
        assert_eq!(parsed.schema(), "ping");
        assert_eq!(parsed.version(), 2);
        assert_eq!(parsed.len(), 2);
    }
}
