use serde::{Deserialize, Serialize};

/// A participant in a signal, either the actor or the subject.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Entity {
    id: String,
    #[serde(rename = "type")]
    kind: String,
}

impl Entity {
    pub(crate) fn new(id: String, kind: String) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

/// The measured observation: a name and a finite value.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SignalData {
    name: String,
    value: f64,
}

impl SignalData {
    pub(crate) fn new(name: String, value: f64) -> Self {
        Self { name, value }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// A fully validated signal, ready to be handed to a sink.
///
/// Values of this type are only built by [`crate::validation::Validator`], so holding
/// one means every nested field passed its checks. The serialized form is the one
/// written to the downstream queue.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SignalPayload {
    event_id: String,
    actor: Entity,
    subject: Entity,
    signal: SignalData,
    occurred_at: i64,
}

impl SignalPayload {
    pub(crate) fn new(
        event_id: String,
        actor: Entity,
        subject: Entity,
        signal: SignalData,
        occurred_at: i64,
    ) -> Self {
        Self {
            event_id,
            actor,
            subject,
            signal,
            occurred_at,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn actor(&self) -> &Entity {
        &self.actor
    }

    pub fn subject(&self) -> &Entity {
        &self.subject
    }

    pub fn signal(&self) -> &SignalData {
        &self.signal
    }

    pub fn occurred_at(&self) -> i64 {
        self.occurred_at
    }
}

// Wire representation, before validation. Every field is optional so that a missing
// field is reported by name instead of as a generic decoding failure, and unknown
// fields are ignored.

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RawEntity {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RawSignalData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RawSignalPayload {
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub actor: Option<RawEntity>,
    #[serde(default)]
    pub subject: Option<RawEntity>,
    #[serde(default)]
    pub signal: Option<RawSignalData>,
    #[serde(default)]
    pub occurred_at: Option<i64>,
}

impl RawSignalPayload {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
