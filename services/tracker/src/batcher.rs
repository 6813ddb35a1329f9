//! Streaming chatter ingest.
//!
//! The chatters document can be arbitrarily large (hundreds of thousands
//! of names for big channels), so it is parsed in a single streaming pass
//! and never buffered whole. Names are queued and handed to the flush
//! callback in fixed-size batches.
//!
//! When `chatter_count` arrives before `chatters` (the upstream has always
//! ordered it that way, but nothing guarantees it), the queue allocation is
//! sized so the final batch fits exactly instead of reserving the full
//! cap. If the declared count is missing or wrong the batcher degrades to
//! cap-sized allocations.
//!
//! Not thread-safe; use one batcher per concurrent stream.

use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use std::fmt;
use std::io::Read;
use thiserror::Error;

/// Default batch cap, matching the upstream's largest observed documents.
pub const DEFAULT_MAX_BATCH: u64 = 100_000;

// Keys inside `chatters` whose arrays contribute names. `broadcaster` is
// deliberately absent: the channel owner is not a viewer.
const ROLE_KEYS: [&str; 6] = [
    "vips",
    "moderators",
    "viewers",
    "staff",
    "admins",
    "global_mods",
];

#[derive(Debug, Error)]
pub enum IngestError {
    /// The document carried a key the state machine does not recognize.
    /// Fatal to the current batch; nothing after the key is consumed.
    #[error("unexpected property '{0}'")]
    UnexpectedProperty(String),
    #[error("malformed chatters document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Bounded-memory batching queue driven by the streaming parser.
pub struct StreamBatcher<F: FnMut(Vec<String>)> {
    queue: Option<Vec<String>>,
    /// Declared total from `chatter_count`; zero means unknown.
    chatter_size: u64,
    flush_count: u64,
    /// Capacity of the current allocation; flush triggers when the queue
    /// reaches it.
    size: u64,
    max_batch: u64,
    flush_fn: F,
    /// Name of the offending key when the parser hit an unexpected
    /// property, so the serde error can be surfaced typed.
    fault: Option<String>,
}

impl<F: FnMut(Vec<String>)> StreamBatcher<F> {
    pub fn new(max_batch: u64, flush_fn: F) -> Self {
        debug_assert!(max_batch > 0);
        Self {
            queue: None,
            chatter_size: 0,
            flush_count: 0,
            size: 0,
            max_batch,
            flush_fn,
            fault: None,
        }
    }

    /// Queue one name, flushing when the current allocation fills up.
    ///
    /// The first enqueue after a flush (or from the initial state) sizes
    /// the new allocation: the smaller of the declared names still
    /// expected and the cap. The subtraction is wrapping on purpose — if
    /// more names arrived than declared, the "remaining" figure underflows
    /// to a huge value and the cap wins, which is exactly the fallback we
    /// want for a wrong or missing `chatter_count`.
    pub fn enqueue(&mut self, name: String) {
        if self.queue.is_none() {
            let mut size = min_with_default(self.chatter_size, self.max_batch, self.max_batch);
            let used = size.wrapping_mul(self.flush_count);
            let left = self.chatter_size.wrapping_sub(used);
            size = min_with_default(left, size, self.max_batch);
            self.size = size;
            self.queue = Some(Vec::with_capacity(usize::try_from(size).unwrap_or(usize::MAX)));
        }
        if let Some(queue) = self.queue.as_mut() {
            queue.push(name);
            if queue.len() as u64 == self.size {
                self.flush();
            }
        }
    }

    /// Hand the queued names to the flush callback and release the queue.
    /// Idempotent: flushing an empty queue is a no-op.
    pub fn flush(&mut self) {
        if self.queue.as_ref().is_none_or(Vec::is_empty) {
            return;
        }
        if let Some(queue) = self.queue.take() {
            (self.flush_fn)(queue);
            self.flush_count += 1;
        }
    }

    /// Parse one chatters document from `reader` in a single pass,
    /// enqueueing every contributing name and flushing whatever remains at
    /// the end.
    pub fn ingest<R: Read>(&mut self, reader: R) -> Result<(), IngestError> {
        let mut de = serde_json::Deserializer::from_reader(reader);
        let parsed = DocSeed { batcher: &mut *self }
            .deserialize(&mut de)
            .and_then(|()| de.end());
        match parsed {
            Ok(()) => {
                // A missing or low chatter_count leaves a partial batch
                // behind; make sure nothing stays queued.
                self.flush();
                Ok(())
            }
            Err(e) => Err(match self.fault.take() {
                Some(prop) => IngestError::UnexpectedProperty(prop),
                None => IngestError::Malformed(e),
            }),
        }
    }

    fn unexpected<E: de::Error>(&mut self, key: &str) -> E {
        self.fault = Some(key.to_owned());
        E::custom(format!("unexpected property '{key}'"))
    }
}

/// `min(a, b)`, except an unset `a` (zero) falls back to `def`.
fn min_with_default(a: u64, b: u64, def: u64) -> u64 {
    if a == 0 { def } else { a.min(b) }
}

// ---------------------------------------------------------------------------
// Streaming document walk
// ---------------------------------------------------------------------------

struct DocSeed<'a, F: FnMut(Vec<String>)> {
    batcher: &'a mut StreamBatcher<F>,
}

impl<'de, F: FnMut(Vec<String>)> DeserializeSeed<'de> for DocSeed<'_, F> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, F: FnMut(Vec<String>)> Visitor<'de> for DocSeed<'_, F> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a chatters document object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "chatter_count" => {
                    self.batcher.chatter_size = map.next_value::<u64>()?;
                }
                // Balanced sub-object; skipped without buffering. Depth is
                // bounded by the deserializer's recursion limit, which
                // caps what an adversarial payload can nest.
                "_links" => {
                    map.next_value::<IgnoredAny>()?;
                }
                "chatters" => {
                    map.next_value_seed(ChattersSeed {
                        batcher: &mut *self.batcher,
                    })?;
                }
                other => return Err(self.batcher.unexpected(other)),
            }
        }
        Ok(())
    }
}

struct ChattersSeed<'a, F: FnMut(Vec<String>)> {
    batcher: &'a mut StreamBatcher<F>,
}

impl<'de, F: FnMut(Vec<String>)> DeserializeSeed<'de> for ChattersSeed<'_, F> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, F: FnMut(Vec<String>)> Visitor<'de> for ChattersSeed<'_, F> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("the chatters role map")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "broadcaster" => {
                    map.next_value::<IgnoredAny>()?;
                }
                role if ROLE_KEYS.contains(&role) => {
                    map.next_value_seed(RoleSeed {
                        batcher: &mut *self.batcher,
                    })?;
                }
                other => return Err(self.batcher.unexpected(other)),
            }
        }
        Ok(())
    }
}

struct RoleSeed<'a, F: FnMut(Vec<String>)> {
    batcher: &'a mut StreamBatcher<F>,
}

impl<'de, F: FnMut(Vec<String>)> DeserializeSeed<'de> for RoleSeed<'_, F> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, F: FnMut(Vec<String>)> Visitor<'de> for RoleSeed<'_, F> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of chatter names")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(name) = seq.next_element::<String>()? {
            self.batcher.enqueue(name);
        }
        Ok(())
    }
}
