//! Event file encoding and naming.
//!
//! Events travel between peers as standalone CBOR files. The file name
//! encodes the global count and revision so peers can tell which events
//! they already hold without downloading them:
//!
//! - save/merge: `{global_count}_{store_id}_{revision_number}.cbor`
//! - baseline: `{global_count}_{unique_identifier}_{store_id}.cbor`

use crate::error::{ModelError, ModelResult};
use crate::event::{EventType, StoreModificationEvent};
use crate::revision::{GlobalCount, RevisionNumber};
use serde::{Deserialize, Serialize};

/// Current event file format version.
pub const EVENT_FILE_FORMAT_VERSION: u16 = 1;

/// Extension of event files.
pub const EVENT_FILE_EXTENSION: &str = "cbor";

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format_version: u16,
    event: &'a StoreModificationEvent,
}

#[derive(Deserialize)]
struct Envelope {
    format_version: u16,
    event: StoreModificationEvent,
}

/// Encodes an event as an event file.
///
/// # Errors
///
/// Fails if the event is incomplete or CBOR encoding fails.
pub fn encode_event(event: &StoreModificationEvent) -> ModelResult<Vec<u8>> {
    if !event.is_committed() {
        return Err(ModelError::InvalidStructure(format!(
            "event {} is incomplete and cannot be encoded",
            event.unique_identifier
        )));
    }
    let mut buf = Vec::new();
    ciborium::into_writer(
        &EnvelopeRef {
            format_version: EVENT_FILE_FORMAT_VERSION,
            event,
        },
        &mut buf,
    )
    .map_err(ModelError::codec)?;
    Ok(buf)
}

/// Decodes an event file.
///
/// # Errors
///
/// Fails on malformed CBOR, an unsupported format version or an
/// incomplete event.
pub fn decode_event(bytes: &[u8]) -> ModelResult<StoreModificationEvent> {
    let envelope: Envelope = ciborium::from_reader(bytes).map_err(ModelError::codec)?;
    if envelope.format_version > EVENT_FILE_FORMAT_VERSION {
        return Err(ModelError::UnsupportedFormat {
            found: envelope.format_version,
            supported: EVENT_FILE_FORMAT_VERSION,
        });
    }
    if !envelope.event.is_committed() {
        return Err(ModelError::InvalidStructure(format!(
            "event file for {} holds an incomplete event",
            envelope.event.unique_identifier
        )));
    }
    if envelope.event.global_count != envelope.event.own_revision.global_count {
        return Err(ModelError::InvalidStructure(format!(
            "event {} has inconsistent global counts",
            envelope.event.unique_identifier
        )));
    }
    Ok(envelope.event)
}

/// Which remote directory a file lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFileKind {
    /// Save or merge event.
    Event,
    /// Baseline event.
    Baseline,
}

/// Parsed components of an event file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventFileName {
    /// Event or baseline.
    pub kind: EventFileKind,
    /// Global count of the event.
    pub global_count: GlobalCount,
    /// Producing store.
    pub store_id: String,
    /// Revision number, for save and merge events.
    pub revision_number: Option<RevisionNumber>,
    /// Unique identifier, for baselines.
    pub unique_identifier: Option<String>,
}

impl EventFileName {
    /// Derives the file name for an event.
    ///
    /// # Errors
    ///
    /// Fails for incomplete events.
    pub fn for_event(event: &StoreModificationEvent) -> ModelResult<Self> {
        match event.event_type {
            EventType::Incomplete => Err(ModelError::InvalidStructure(format!(
                "incomplete event {} has no file name",
                event.unique_identifier
            ))),
            EventType::Baseline => Ok(Self {
                kind: EventFileKind::Baseline,
                global_count: event.global_count,
                store_id: event.store_id().to_string(),
                revision_number: None,
                unique_identifier: Some(event.unique_identifier.clone()),
            }),
            EventType::Save | EventType::Merge => Ok(Self {
                kind: EventFileKind::Event,
                global_count: event.global_count,
                store_id: event.store_id().to_string(),
                revision_number: Some(event.revision_number()),
                unique_identifier: None,
            }),
        }
    }

    /// Renders the file name.
    pub fn file_name(&self) -> String {
        match self.kind {
            EventFileKind::Event => format!(
                "{}_{}_{}.{EVENT_FILE_EXTENSION}",
                self.global_count,
                self.store_id,
                self.revision_number.unwrap_or_default()
            ),
            EventFileKind::Baseline => format!(
                "{}_{}_{}.{EVENT_FILE_EXTENSION}",
                self.global_count,
                self.unique_identifier.as_deref().unwrap_or_default(),
                self.store_id
            ),
        }
    }

    /// Parses a file name found in the events or baselines directory.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidFileName`] if the name does not follow
    /// the scheme.
    pub fn parse(kind: EventFileKind, file_name: &str) -> ModelResult<Self> {
        let invalid = || ModelError::InvalidFileName(file_name.to_string());
        let stem = file_name
            .strip_suffix(EVENT_FILE_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(invalid)?;
        let (count, rest) = stem.split_once('_').ok_or_else(invalid)?;
        let global_count: GlobalCount = count.parse().map_err(|_| invalid())?;

        match kind {
            EventFileKind::Event => {
                let (store_id, revision) = rest.rsplit_once('_').ok_or_else(invalid)?;
                let revision_number: RevisionNumber = revision.parse().map_err(|_| invalid())?;
                if store_id.is_empty() {
                    return Err(invalid());
                }
                Ok(Self {
                    kind,
                    global_count,
                    store_id: store_id.to_string(),
                    revision_number: Some(revision_number),
                    unique_identifier: None,
                })
            }
            EventFileKind::Baseline => {
                let (unique_identifier, store_id) = rest.split_once('_').ok_or_else(invalid)?;
                if unique_identifier.is_empty() || store_id.is_empty() {
                    return Err(invalid());
                }
                Ok(Self {
                    kind,
                    global_count,
                    store_id: store_id.to_string(),
                    revision_number: None,
                    unique_identifier: Some(unique_identifier.to_string()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_change::{GlobalIdentifier, ObjectChange};
    use crate::property::PropertyChangeValue;
    use crate::revision::{Revision, RevisionSet};

    fn save_event() -> StoreModificationEvent {
        let mut event = StoreModificationEvent::new_incomplete(
            "e-1",
            Revision::new("store-a", 4, 12),
            RevisionSet::from_revisions([Revision::new("store-b", 2, 9)]),
            "v1",
        );
        event.object_changes.push(ObjectChange::insert(
            GlobalIdentifier::new("Person", "g1"),
            vec![
                PropertyChangeValue::attribute("name", "Ann"),
                PropertyChangeValue::attribute("score", 2.5f64),
                PropertyChangeValue::to_many("friends", ["g2"], Vec::<String>::new()),
            ],
        ));
        event.commit(EventType::Save).unwrap();
        event
    }

    #[test]
    fn encoded_event_decodes_to_same_event() {
        let event = save_event();
        let bytes = encode_event(&event).unwrap();
        assert_eq!(decode_event(&bytes).unwrap(), event);
    }

    #[test]
    fn incomplete_events_are_not_encoded() {
        let event = StoreModificationEvent::new_incomplete(
            "e-2",
            Revision::new("a", 1, 1),
            RevisionSet::new(),
            "v1",
        );
        assert!(encode_event(&event).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            decode_event(&[0xff, 0x00, 0x13]),
            Err(ModelError::Codec(_))
        ));
    }

    #[test]
    fn event_file_names() {
        let event = save_event();
        let name = EventFileName::for_event(&event).unwrap();
        assert_eq!(name.file_name(), "12_store-a_4.cbor");

        let parsed = EventFileName::parse(EventFileKind::Event, "12_store-a_4.cbor").unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn baseline_file_names() {
        let mut event = save_event();
        event.event_type = EventType::Baseline;
        let name = EventFileName::for_event(&event).unwrap();
        assert_eq!(name.file_name(), "12_e-1_store-a.cbor");
        assert_eq!(
            EventFileName::parse(EventFileKind::Baseline, &name.file_name()).unwrap(),
            name
        );
    }

    #[test]
    fn malformed_names() {
        for bad in ["", "12.cbor", "x_a_1.cbor", "12_a_x.cbor", "12_a_1.json", "12__1.cbor"] {
            assert!(
                EventFileName::parse(EventFileKind::Event, bad).is_err(),
                "{bad} should not parse"
            );
        }
    }
}
