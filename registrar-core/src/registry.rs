//! Event registry: tag -> typed decoder.
//!
//! The registry is the single place where a persisted tag is turned back into
//! a [`StudentEvent`]. Each [`Registration`] pairs an [`EventKind`] with a
//! decoder producing the matching sum-type variant, so handlers only ever see
//! typed payloads. The process-wide table ([`EventRegistry::global`]) is built
//! once on first use and is read-only afterwards.

use std::{collections::HashMap, fmt, sync::LazyLock};

use serde::de::DeserializeOwned;

use crate::{
    domain::{
        LookupCodeSet, StudentAdded, StudentEnrolled, StudentEvent, StudentStatusSet,
        StudentUnenrolled, StudentUpdated,
    },
    event::{DomainEvent, Envelope, EventDecodeError, EventKind},
};

/// Decode raw payload bytes into the sum type.
pub type Decoder = fn(&[u8]) -> Result<StudentEvent, serde_json::Error>;

fn decode_as<E>(data: &[u8]) -> Result<StudentEvent, serde_json::Error>
where
    E: DomainEvent + DeserializeOwned + Into<StudentEvent>,
{
    serde_json::from_slice::<E>(data).map(Into::into)
}

/// One entry of the registry.
#[derive(Clone, Copy)]
pub struct Registration {
    kind: EventKind,
    decode: Decoder,
}

impl Registration {
    /// Registration decoding the payload type `E` under `E::KIND`.
    #[must_use]
    pub fn of<E>() -> Self
    where
        E: DomainEvent + DeserializeOwned + Into<StudentEvent>,
    {
        Self {
            kind: E::KIND,
            decode: decode_as::<E>,
        }
    }

    /// Registration with a hand-written decoder, e.g. to upcast an older
    /// payload schema stored under the same tag.
    #[must_use]
    pub const fn with_decoder(kind: EventKind, decode: Decoder) -> Self {
        Self { kind, decode }
    }

    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    /// # Errors
    ///
    /// Returns [`EventDecodeError::Payload`] if `data` does not match the
    /// registered schema.
    pub fn decode(&self, data: &[u8]) -> Result<StudentEvent, EventDecodeError> {
        (self.decode)(data).map_err(|source| EventDecodeError::Payload {
            kind: self.kind,
            source,
        })
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

static GLOBAL: LazyLock<EventRegistry> = LazyLock::new(EventRegistry::standard);

/// Lookup table from persisted tag to [`Registration`].
#[derive(Debug, Clone, Default)]
pub struct EventRegistry {
    entries: HashMap<&'static str, Registration>,
}

impl EventRegistry {
    /// An empty registry. Every lookup fails until kinds are registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every student event kind registered.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry
            .register(Registration::of::<StudentAdded>())
            .register(Registration::of::<StudentStatusSet>())
            .register(Registration::of::<StudentUpdated>())
            .register(Registration::of::<StudentEnrolled>())
            .register(Registration::of::<StudentUnenrolled>())
            .register(Registration::of::<LookupCodeSet>());
        registry
    }

    /// The process-wide registry used by [`Student::apply`].
    ///
    /// [`Student::apply`]: crate::student::Student::apply
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Register (or replace) the decoder for a kind.
    pub fn register(&mut self, registration: Registration) -> &mut Self {
        let tag = registration.kind().as_str();
        if self.entries.insert(tag, registration).is_some() {
            tracing::debug!(kind = tag, "replaced event registration");
        }
        self
    }

    /// Tags currently registered, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.entries.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// # Errors
    ///
    /// Returns [`EventDecodeError::UnknownKind`] if nothing is registered
    /// under `tag`.
    pub fn lookup(&self, tag: &str) -> Result<&Registration, EventDecodeError> {
        self.entries
            .get(tag)
            .ok_or_else(|| EventDecodeError::UnknownKind {
                kind: tag.to_string(),
                expected: self.kinds(),
            })
    }

    /// Decode an envelope's payload into the sum type.
    ///
    /// # Errors
    ///
    /// Returns [`EventDecodeError::UnknownKind`] for unregistered tags and
    /// [`EventDecodeError::Payload`] for payloads that fail to deserialize.
    pub fn decode(&self, envelope: &Envelope) -> Result<StudentEvent, EventDecodeError> {
        self.lookup(envelope.kind())?.decode(envelope.data())
    }
}
