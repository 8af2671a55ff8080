use std::collections::BTreeMap;

use fnv::FnvHashMap;

use super::body::{decode_empty, decode_raw, decode_trigger, EventBody};
use super::codec::ByteReader;
use super::{type_id, Event, Flags};
use crate::error::{Error, Result};

/// Function decoding the subtype-specific part of an event.
pub type BodyDecoder = fn(&mut ByteReader<'_>) -> Result<EventBody>;

/// Maximum depth of nested packets accepted when decoding.
pub const MAX_NESTING: usize = 64;

const BUILTINS: &[(&str, BodyDecoder)] = &[
    ("BASE", decode_empty),
    ("PACKET", decode_empty),
    ("SYNC", decode_empty),
    ("RAW", decode_raw),
    ("TRIGGER", decode_trigger),
];

struct Entry {
    mnemonic: String,
    decoder: BodyDecoder,
}

/// Lookup table from type identifiers to body decoders.
///
/// Built once at startup and shared by reference with every component that
/// needs to decode events.
#[derive(Default)]
pub struct Registry {
    entries: FnvHashMap<u32, Entry>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with all the built-in event types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (mnemonic, decoder) in BUILTINS {
            registry.entries.insert(
                type_id(mnemonic),
                Entry {
                    mnemonic: mnemonic.to_string(),
                    decoder: *decoder,
                },
            );
        }
        registry
    }

    /// Registers a new event type under the identifier derived from
    /// `mnemonic`, returning that identifier.
    ///
    /// Registering an identifier that's already taken is an error.
    pub fn register(&mut self, mnemonic: &str, decoder: BodyDecoder) -> Result<u32> {
        let id = type_id(mnemonic);
        if let Some(existing) = self.entries.get(&id) {
            return Err(Error::DuplicateEventType {
                id,
                mnemonic: existing.mnemonic.clone(),
            });
        }
        debug!("registering event type {} ({:#010x})", mnemonic, id);
        self.entries.insert(
            id,
            Entry {
                mnemonic: mnemonic.to_string(),
                decoder,
            },
        );
        Ok(id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn mnemonic(&self, id: u32) -> Option<&str> {
        self.entries.get(&id).map(|e| e.mnemonic.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decodes the next event from the reader.
    ///
    /// If the leading type identifier is not registered this fails with
    /// `UnknownEventType` and the reader is left positioned at the start of
    /// the offending event.
    pub fn decode(&self, r: &mut ByteReader<'_>) -> Result<Event> {
        self.decode_nested(r, 0)
    }

    /// Decodes a single event from a byte slice.
    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<Event> {
        let mut r = ByteReader::new(bytes);
        let event = self.decode(&mut r)?;
        if (r.position() as usize) < bytes.len() {
            warn!(
                "ignoring {} trailing bytes after event",
                bytes.len() - r.position() as usize
            );
        }
        Ok(event)
    }

    fn decode_nested(&self, r: &mut ByteReader<'_>, depth: usize) -> Result<Event> {
        if depth > MAX_NESTING {
            return Err(Error::NestingTooDeep(MAX_NESTING));
        }
        let id = r.peek_u32()?;
        let decoder = match self.entries.get(&id) {
            Some(entry) => entry.decoder,
            None => return Err(Error::UnknownEventType(id)),
        };

        let type_id = r.read_u32()?;
        let run_n = r.read_u32()?;
        let event_n = r.read_u32()?;
        let ts_begin = r.read_u64()?;
        let ts_end = r.read_u64()?;
        let flags = Flags::from_bits(r.read_u32()?);
        let tag_count = r.read_u32()?;
        let mut tags = BTreeMap::new();
        for _ in 0..tag_count {
            let key = r.read_string()?;
            let value = r.read_string()?;
            tags.insert(key, value);
        }
        let body = decoder(r)?;

        let mut children = Vec::new();
        if flags.contains(Flags::PACKET) {
            let count = r.read_u32()?;
            for _ in 0..count {
                children.push(self.decode_nested(r, depth + 1)?);
            }
        }

        Ok(Event {
            type_id,
            run_n,
            event_n,
            ts_begin,
            ts_end,
            flags,
            tags,
            body,
            children,
        })
    }
}

#[cfg(test)]
fn sample_raw() -> Event {
    let mut event = Event::raw("telescope plane 3");
    event.set_run_n(12);
    event.set_event_n(4005);
    event.set_timestamp(1_000, 1_025);
    event.set_tag("TLU", 77);
    if let EventBody::Raw(raw) = event.body_mut() {
        raw.add_block(0, vec![1, 2, 3, 4]);
        raw.add_block(7, vec![]);
    }
    event
}

#[test]
fn builtin_types_round_trip() {
    let registry = Registry::with_builtins();

    let mut bore = Event::base();
    bore.set_flag(Flags::BORE);
    let mut trigger = Event::trigger(99);
    trigger.set_timestamp(5, 6);
    let events = vec![bore, sample_raw(), trigger, Event::sync(), Event::base()];

    for event in events {
        let decoded = registry.decode_bytes(&event.to_bytes()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.type_id(), event.type_id());
    }
}

#[test]
fn empty_tags_and_empty_packet_round_trip() {
    let registry = Registry::with_builtins();
    let packet = Event::packet();
    assert!(packet.tags().is_empty());
    let decoded = registry.decode_bytes(&packet.to_bytes()).unwrap();
    assert!(decoded.is_packet());
    assert_eq!(decoded.children().len(), 0);
    assert_eq!(decoded, packet);
    assert_eq!(decoded.timestamp_begin(), None);
}

#[test]
fn packet_with_two_children() {
    let registry = Registry::with_builtins();
    let mut first = Event::trigger(10);
    first.set_event_n(10);
    let mut second = sample_raw();
    second.set_event_n(11);

    let mut packet = Event::packet();
    packet.set_event_n(10);
    packet.add_child(first);
    packet.add_child(second);

    let bytes = packet.to_bytes();
    let decoded = registry.decode_bytes(&bytes).unwrap();
    assert_eq!(decoded.children().len(), 2);
    assert_eq!(decoded.children()[0].type_id(), super::TYPE_TRIGGER);
    assert_eq!(decoded.children()[0].event_n(), 10);
    assert_eq!(decoded.children()[1].type_id(), super::TYPE_RAW);
    assert_eq!(decoded.children()[1].event_n(), 11);
    assert_eq!(decoded, packet);
}

#[test]
fn unknown_type_is_rejected_without_consuming() {
    let registry = Registry::with_builtins();
    let stranger = Event::new(type_id("NOT_REGISTERED"), EventBody::Empty);
    let bytes = stranger.to_bytes();

    let mut r = ByteReader::new(&bytes[..]);
    match registry.decode(&mut r) {
        Err(Error::UnknownEventType(id)) => assert_eq!(id, type_id("NOT_REGISTERED")),
        other => panic!("expected unknown event type, got {:?}", other),
    }
    assert_eq!(r.position(), 0);

    // registry stays usable
    let known = Event::base();
    assert_eq!(registry.decode_bytes(&known.to_bytes()).unwrap(), known);
}

#[test]
fn custom_type_registration() {
    let mut registry = Registry::with_builtins();
    let id = registry.register("TELESCOPE", decode_raw).unwrap();
    assert_eq!(registry.mnemonic(id), Some("TELESCOPE"));

    let mut event = Event::new(id, EventBody::Raw(Default::default()));
    event.set_event_n(3);
    assert_eq!(registry.decode_bytes(&event.to_bytes()).unwrap(), event);

    match registry.register("TELESCOPE", decode_empty) {
        Err(Error::DuplicateEventType { id: dup, .. }) => assert_eq!(dup, id),
        other => panic!("expected duplicate error, got {:?}", other),
    }
    match registry.register("RAW", decode_raw) {
        Err(Error::DuplicateEventType { mnemonic, .. }) => assert_eq!(mnemonic, "RAW"),
        other => panic!("expected duplicate error, got {:?}", other),
    }
}

#[test]
fn truncated_event_fails() {
    let registry = Registry::with_builtins();
    let bytes = sample_raw().to_bytes();
    match registry.decode_bytes(&bytes[..bytes.len() - 2]) {
        Err(Error::Truncated(_)) => (),
        other => panic!("expected truncation, got {:?}", other),
    }
}
