//! Event model.
//!
//! An [`Event`] is the unit of data flowing from producers to collectors.
//! Every event carries a common header (type identifier, run and event
//! numbers, a timestamp interval, flags and string tags), a subtype-specific
//! [`EventBody`], and, for packets, an ordered list of owned child events.
//!
//! # Wire format
//!
//! Events are self-delimiting, there is no outer length prefix. Fields are
//! written in the following order, integers little-endian:
//!
//! ```text
//! type_id u32 | run_n u32 | event_n u32 | ts_begin u64 | ts_end u64 | flags u32
//! tag_count u32 | (key str, value str)*
//! body fields
//! [child_count u32 | child*]   only if PACKET
//! ```
//!
//! Decoding goes through a [`Registry`], which peeks at the leading type
//! identifier and dispatches to the body decoder registered for it.
//!
//! [`Event`]: struct.Event.html
//! [`EventBody`]: enum.EventBody.html
//! [`Registry`]: struct.Registry.html

mod body;
mod codec;
mod registry;

pub use body::{decode_empty, decode_raw, decode_trigger, EventBody, RawData, TriggerData};
pub use codec::{ByteReader, ByteWriter};
pub use registry::{BodyDecoder, Registry, MAX_NESTING};

use std::collections::BTreeMap;
use std::ops::BitOr;

/// Sentinel marking an unset timestamp.
pub const NO_TIMESTAMP: u64 = u64::MAX;

pub const TYPE_BASE: u32 = type_id("BASE");
pub const TYPE_PACKET: u32 = type_id("PACKET");
pub const TYPE_SYNC: u32 = type_id("SYNC");
pub const TYPE_RAW: u32 = type_id("RAW");
pub const TYPE_TRIGGER: u32 = type_id("TRIGGER");

/// Derives the 32-bit type identifier from a short mnemonic.
///
/// Walks the string from its last byte to the first, starting from `5381`
/// and folding each byte in with `hash * 33 ^ byte`.
pub const fn type_id(mnemonic: &str) -> u32 {
    let bytes = mnemonic.as_bytes();
    let mut hash: u32 = 5381;
    let mut i = bytes.len();
    while i > 0 {
        i -= 1;
        hash = hash.wrapping_mul(33) ^ bytes[i] as u32;
    }
    hash
}

/// Event flag bit set.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Flags(u32);

impl Flags {
    /// Begin-of-run marker
    pub const BORE: Flags = Flags(0x01);
    /// End-of-run marker
    pub const EORE: Flags = Flags(0x02);
    /// Event owns child events
    pub const PACKET: Flags = Flags(0x40);

    pub const fn empty() -> Self {
        Flags(0)
    }

    /// Unknown bits are preserved.
    pub const fn from_bits(bits: u32) -> Self {
        Flags(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Single data acquisition record.
#[derive(Clone, Debug)]
pub struct Event {
    type_id: u32,
    run_n: u32,
    event_n: u32,
    ts_begin: u64,
    ts_end: u64,
    flags: Flags,
    tags: BTreeMap<String, String>,
    body: EventBody,
    children: Vec<Event>,
}

impl PartialEq for Event {
    fn eq(&self, other: &Event) -> bool {
        self.type_id == other.type_id
            && self.run_n == other.run_n
            && self.event_n == other.event_n
            && self.ts_begin == other.ts_begin
            && self.ts_end == other.ts_end
            && self.flags() == other.flags()
            && self.tags == other.tags
            && self.body == other.body
            && self.children == other.children
    }
}

impl Event {
    /// Creates an event of an arbitrary registered type.
    ///
    /// The body shape must match the decoder registered for `type_id`,
    /// otherwise the encoded event won't decode back into the same value.
    pub fn new(type_id: u32, body: EventBody) -> Self {
        Self {
            type_id,
            run_n: 0,
            event_n: 0,
            ts_begin: NO_TIMESTAMP,
            ts_end: NO_TIMESTAMP,
            flags: Flags::empty(),
            tags: BTreeMap::new(),
            body,
            children: Vec::new(),
        }
    }

    pub fn base() -> Self {
        Self::new(TYPE_BASE, EventBody::Empty)
    }

    pub fn raw(description: &str) -> Self {
        Self::new(TYPE_RAW, EventBody::Raw(RawData::new(description)))
    }

    pub fn trigger(trigger_n: u32) -> Self {
        Self::new(TYPE_TRIGGER, EventBody::Trigger(TriggerData { trigger_n }))
    }

    /// Creates an empty packet. Children are added with `add_child`.
    pub fn packet() -> Self {
        let mut event = Self::new(TYPE_PACKET, EventBody::Empty);
        event.flags.insert(Flags::PACKET);
        event
    }

    pub fn sync() -> Self {
        Self::new(TYPE_SYNC, EventBody::Empty)
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn run_n(&self) -> u32 {
        self.run_n
    }

    pub fn set_run_n(&mut self, run_n: u32) {
        self.run_n = run_n;
    }

    pub fn event_n(&self) -> u32 {
        self.event_n
    }

    pub fn set_event_n(&mut self, event_n: u32) {
        self.event_n = event_n;
    }

    pub fn timestamp_begin(&self) -> Option<u64> {
        match self.ts_begin {
            NO_TIMESTAMP => None,
            ts => Some(ts),
        }
    }

    pub fn timestamp_end(&self) -> Option<u64> {
        match self.ts_end {
            NO_TIMESTAMP => None,
            ts => Some(ts),
        }
    }

    /// Sets the `[begin, end)` interval. `NO_TIMESTAMP` unsets a bound.
    pub fn set_timestamp(&mut self, begin: u64, end: u64) {
        self.ts_begin = begin;
        self.ts_end = end;
    }

    /// Flag set as it goes over the wire. `PACKET` is always present when
    /// the event has children.
    pub fn flags(&self) -> Flags {
        if self.children.is_empty() {
            self.flags
        } else {
            self.flags | Flags::PACKET
        }
    }

    pub fn set_flag(&mut self, flag: Flags) {
        self.flags.insert(flag);
    }

    pub fn clear_flag(&mut self, flag: Flags) {
        self.flags.remove(flag);
    }

    pub fn is_bore(&self) -> bool {
        self.flags.contains(Flags::BORE)
    }

    pub fn is_eore(&self) -> bool {
        self.flags.contains(Flags::EORE)
    }

    pub fn is_packet(&self) -> bool {
        self.flags().contains(Flags::PACKET)
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|v| v.as_str())
    }

    pub fn set_tag<V: ToString>(&mut self, key: &str, value: V) {
        self.tags.insert(key.to_string(), value.to_string());
    }

    pub fn remove_tag(&mut self, key: &str) -> Option<String> {
        self.tags.remove(key)
    }

    pub fn body(&self) -> &EventBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut EventBody {
        &mut self.body
    }

    pub fn children(&self) -> &[Event] {
        &self.children
    }

    /// Appends a child event, turning this event into a packet.
    pub fn add_child(&mut self, child: Event) {
        self.flags.insert(Flags::PACKET);
        self.children.push(child);
    }

    pub fn into_children(self) -> Vec<Event> {
        self.children
    }

    pub fn encode(&self, w: &mut ByteWriter) {
        let flags = self.flags();
        w.put_u32(self.type_id);
        w.put_u32(self.run_n);
        w.put_u32(self.event_n);
        w.put_u64(self.ts_begin);
        w.put_u64(self.ts_end);
        w.put_u32(flags.bits());
        w.put_u32(self.tags.len() as u32);
        for (key, value) in &self.tags {
            w.put_str(key);
            w.put_str(value);
        }
        self.body.encode(w);
        if flags.contains(Flags::PACKET) {
            w.put_u32(self.children.len() as u32);
            for child in &self.children {
                child.encode(w);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        self.encode(&mut w);
        w.into_inner()
    }
}

#[test]
fn type_id_is_stable() {
    // h("") = 5381, h("A") = 5381 * 33 ^ 65
    assert_eq!(type_id(""), 5381);
    assert_eq!(type_id("A"), (5381u32 * 33) ^ 65);
    assert_eq!(type_id("AB"), ((5381u32 * 33 ^ 66) * 33) ^ 65);
    assert_ne!(TYPE_RAW, TYPE_TRIGGER);
}

#[test]
fn children_imply_packet_flag() {
    let mut event = Event::base();
    assert!(!event.is_packet());
    event.add_child(Event::trigger(1));
    event.clear_flag(Flags::PACKET);
    assert!(event.is_packet());
    assert_eq!(event.children().len(), 1);
}
