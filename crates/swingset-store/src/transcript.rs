use crate::{CleanupProgress, StoreError, StoreResult};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Position range and running hash of the span a vat is currently appending to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanBounds {
    pub start_pos: u64,
    pub end_pos: u64,
    pub hash: String,
    pub incarnation: u64,
}

/// Per-vat delivery transcripts, split into spans at each snapshot or
/// upgrade.
pub trait TranscriptStore {
    fn init_transcript(&mut self, vat_id: &str) -> StoreResult<()>;

    fn add_item(&mut self, vat_id: &str, item: &str) -> StoreResult<()>;

    fn get_current_span_bounds(&self, vat_id: &str) -> StoreResult<SpanBounds>;

    /// Items of the current span, starting at absolute position `start_pos`.
    fn read_span(&self, vat_id: &str, start_pos: Option<u64>) -> StoreResult<Vec<String>>;

    /// Closes the current span and opens an empty one at the same position.
    fn rollover_span(&mut self, vat_id: &str) -> StoreResult<u64>;

    /// Like [`TranscriptStore::rollover_span`] but also starts a new
    /// incarnation.
    fn rollover_incarnation(&mut self, vat_id: &str) -> StoreResult<u64>;

    /// Marks the vat's transcript as no longer current, leaving the items in
    /// place until [`TranscriptStore::delete_vat_transcripts`] removes them.
    fn stop_using_transcript(&mut self, vat_id: &str) -> StoreResult<()>;

    /// Deletes up to `budget` spans (all of them when `None`).
    fn delete_vat_transcripts(
        &mut self,
        vat_id: &str,
        budget: Option<u64>,
    ) -> StoreResult<CleanupProgress>;
}

#[derive(Debug, Clone, Default)]
struct Span {
    start_pos: u64,
    items: Vec<String>,
    incarnation: u64,
}

impl Span {
    fn end_pos(&self) -> u64 {
        self.start_pos + self.items.len() as u64
    }

    fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for item in &self.items {
            hasher.update(item.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Default)]
struct VatTranscript {
    old_spans: Vec<Span>,
    current: Span,
    in_use: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemTranscriptStore {
    vats: BTreeMap<String, VatTranscript>,
}

impl MemTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_transcript(&self, vat_id: &str) -> bool {
        self.vats.contains_key(vat_id)
    }

    fn live(&mut self, vat_id: &str) -> StoreResult<&mut VatTranscript> {
        let vat = self
            .vats
            .get_mut(vat_id)
            .ok_or_else(|| StoreError::UnknownTranscript(vat_id.to_owned()))?;
        if !vat.in_use {
            return Err(StoreError::TranscriptRetired(vat_id.to_owned()));
        }
        Ok(vat)
    }

    fn rollover(&mut self, vat_id: &str, new_incarnation: bool) -> StoreResult<u64> {
        let vat = self.live(vat_id)?;
        let end_pos = vat.current.end_pos();
        let incarnation = vat.current.incarnation + u64::from(new_incarnation);
        let closed = std::mem::replace(
            &mut vat.current,
            Span {
                start_pos: end_pos,
                items: Vec::new(),
                incarnation,
            },
        );
        vat.old_spans.push(closed);
        Ok(end_pos)
    }
}

impl TranscriptStore for MemTranscriptStore {
    fn init_transcript(&mut self, vat_id: &str) -> StoreResult<()> {
        self.vats.insert(
            vat_id.to_owned(),
            VatTranscript {
                in_use: true,
                ..Default::default()
            },
        );
        Ok(())
    }

    fn add_item(&mut self, vat_id: &str, item: &str) -> StoreResult<()> {
        self.live(vat_id)?.current.items.push(item.to_owned());
        Ok(())
    }

    fn get_current_span_bounds(&self, vat_id: &str) -> StoreResult<SpanBounds> {
        let vat = self
            .vats
            .get(vat_id)
            .ok_or_else(|| StoreError::UnknownTranscript(vat_id.to_owned()))?;
        let span = &vat.current;
        Ok(SpanBounds {
            start_pos: span.start_pos,
            end_pos: span.end_pos(),
            hash: span.hash(),
            incarnation: span.incarnation,
        })
    }

    fn read_span(&self, vat_id: &str, start_pos: Option<u64>) -> StoreResult<Vec<String>> {
        let vat = self
            .vats
            .get(vat_id)
            .ok_or_else(|| StoreError::UnknownTranscript(vat_id.to_owned()))?;
        let span = &vat.current;
        let skip = start_pos
            .map(|pos| pos.saturating_sub(span.start_pos) as usize)
            .unwrap_or(0);
        Ok(span.items.iter().skip(skip).cloned().collect())
    }

    fn rollover_span(&mut self, vat_id: &str) -> StoreResult<u64> {
        self.rollover(vat_id, false)
    }

    fn rollover_incarnation(&mut self, vat_id: &str) -> StoreResult<u64> {
        self.rollover(vat_id, true)
    }

    fn stop_using_transcript(&mut self, vat_id: &str) -> StoreResult<()> {
        if let Some(vat) = self.vats.get_mut(vat_id) {
            vat.in_use = false;
        }
        Ok(())
    }

    fn delete_vat_transcripts(
        &mut self,
        vat_id: &str,
        budget: Option<u64>,
    ) -> StoreResult<CleanupProgress> {
        let Some(vat) = self.vats.get_mut(vat_id) else {
            return Ok(CleanupProgress {
                done: true,
                cleanups: 0,
            });
        };
        let limit = budget.unwrap_or(u64::MAX);
        let mut cleanups = 0;
        while cleanups < limit && !vat.old_spans.is_empty() {
            vat.old_spans.pop();
            cleanups += 1;
        }
        if cleanups < limit {
            // The current span goes last.
            self.vats.remove(vat_id);
            cleanups += 1;
            return Ok(CleanupProgress {
                done: true,
                cleanups,
            });
        }
        Ok(CleanupProgress {
            done: false,
            cleanups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_track_positions() {
        let mut store = MemTranscriptStore::new();
        store.init_transcript("v1").unwrap();
        store.add_item("v1", "a").unwrap();
        store.add_item("v1", "b").unwrap();
        let bounds = store.get_current_span_bounds("v1").unwrap();
        assert_eq!((bounds.start_pos, bounds.end_pos), (0, 2));
        assert_eq!(store.read_span("v1", Some(1)).unwrap(), vec!["b"]);

        assert_eq!(store.rollover_span("v1").unwrap(), 2);
        store.add_item("v1", "c").unwrap();
        let bounds = store.get_current_span_bounds("v1").unwrap();
        assert_eq!((bounds.start_pos, bounds.end_pos), (2, 3));
        assert_eq!(store.read_span("v1", None).unwrap(), vec!["c"]);

        store.rollover_incarnation("v1").unwrap();
        assert_eq!(store.get_current_span_bounds("v1").unwrap().incarnation, 1);
    }

    #[test]
    fn retired_transcript_refuses_writes_and_deletes_in_budgeted_steps() {
        let mut store = MemTranscriptStore::new();
        store.init_transcript("v2").unwrap();
        store.add_item("v2", "a").unwrap();
        store.rollover_span("v2").unwrap();
        store.rollover_span("v2").unwrap();
        store.stop_using_transcript("v2").unwrap();
        assert!(matches!(
            store.add_item("v2", "x"),
            Err(StoreError::TranscriptRetired(_))
        ));

        let step = store.delete_vat_transcripts("v2", Some(1)).unwrap();
        assert_eq!(step, CleanupProgress { done: false, cleanups: 1 });
        let step = store.delete_vat_transcripts("v2", None).unwrap();
        assert_eq!(step, CleanupProgress { done: true, cleanups: 2 });
        assert!(!store.has_transcript("v2"));
    }
}
