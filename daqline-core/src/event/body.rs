//! Subtype-specific event payloads.

use super::codec::{ByteReader, ByteWriter};
use crate::Result;

/// Payload carried after the common event header.
///
/// The set of shapes is closed. Several registered type identifiers can
/// share a single shape, e.g. `BASE`, `PACKET` and `SYNC` all carry `Empty`.
#[derive(Clone, Debug, PartialEq)]
pub enum EventBody {
    Empty,
    Raw(RawData),
    Trigger(TriggerData),
}

impl Default for EventBody {
    fn default() -> Self {
        EventBody::Empty
    }
}

impl EventBody {
    pub fn encode(&self, w: &mut ByteWriter) {
        match self {
            EventBody::Empty => (),
            EventBody::Raw(raw) => raw.encode(w),
            EventBody::Trigger(trigger) => w.put_u32(trigger.trigger_n),
        }
    }

    pub fn as_raw(&self) -> Option<&RawData> {
        match self {
            EventBody::Raw(raw) => Some(raw),
            _ => None,
        }
    }

    pub fn as_raw_mut(&mut self) -> Option<&mut RawData> {
        match self {
            EventBody::Raw(raw) => Some(raw),
            _ => None,
        }
    }

    pub fn as_trigger(&self) -> Option<&TriggerData> {
        match self {
            EventBody::Trigger(trigger) => Some(trigger),
            _ => None,
        }
    }
}

/// Opaque data blocks read out from a device, each tagged with a block id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawData {
    pub description: String,
    blocks: Vec<(u32, Vec<u8>)>,
}

impl RawData {
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            blocks: Vec::new(),
        }
    }

    /// Appends a block, returning its index.
    pub fn add_block(&mut self, id: u32, data: Vec<u8>) -> usize {
        self.blocks.push((id, data));
        self.blocks.len() - 1
    }

    pub fn blocks(&self) -> &[(u32, Vec<u8>)] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> Option<&[u8]> {
        self.blocks.get(index).map(|(_, data)| data.as_slice())
    }

    fn encode(&self, w: &mut ByteWriter) {
        w.put_str(&self.description);
        w.put_u32(self.blocks.len() as u32);
        for (id, data) in &self.blocks {
            w.put_u32(*id);
            w.put_bytes(data);
        }
    }
}

/// Trigger logic unit record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TriggerData {
    pub trigger_n: u32,
}

pub fn decode_empty(_: &mut ByteReader<'_>) -> Result<EventBody> {
    Ok(EventBody::Empty)
}

pub fn decode_raw(r: &mut ByteReader<'_>) -> Result<EventBody> {
    let mut raw = RawData::new(&r.read_string()?);
    let count = r.read_u32()?;
    for _ in 0..count {
        let id = r.read_u32()?;
        raw.blocks.push((id, r.read_bytes()?));
    }
    Ok(EventBody::Raw(raw))
}

pub fn decode_trigger(r: &mut ByteReader<'_>) -> Result<EventBody> {
    Ok(EventBody::Trigger(TriggerData {
        trigger_n: r.read_u32()?,
    }))
}
