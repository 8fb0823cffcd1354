//! Merge of independently clocked sources by common time.
//!
//! Each poll gathers the events of every source into one pending buffer and
//! releases only the prefix at or below the common-time watermark: the
//! smallest `last_delivered()` of all sources still producing. Anything later
//! waits until every source has caught up, so no event is ever released ahead
//! of an earlier one from a slower source.

use crate::source::{EventSource, SpecialQueue, StreamError};
use crate::types::{Event, SpecialBlock, SyncRole};
use tracing::{debug, info, warn};

/// Sources beyond this cannot be told apart by the `u8` event id.
pub const MAX_SOURCES: usize = 256;

/// Merges several event sources into one time-ordered stream.
///
/// Events are tagged with the index of the source they came from. Ties in
/// timestamp are broken by that index.
pub struct StreamMerger {
    sources: Vec<Box<dyn EventSource>>,
    pending: Vec<Event>,
    specials: SpecialQueue,
    watermark: Option<u64>,
    last_delivered: Option<u64>,
    started: bool,
}

impl StreamMerger {
    /// Takes ownership of `sources`. Source `i` tags its events with id `i`.
    pub fn new(sources: Vec<Box<dyn EventSource>>) -> Result<Self, StreamError> {
        if sources.is_empty() {
            return Err(StreamError::InvalidConfig(
                "merger needs at least one source".to_string(),
            ));
        }
        if sources.len() > MAX_SOURCES {
            return Err(StreamError::InvalidConfig(format!(
                "at most {} sources can be merged, got {}",
                MAX_SOURCES,
                sources.len()
            )));
        }
        let masters = sources
            .iter()
            .filter(|s| s.sync_role() == SyncRole::Master)
            .count();
        if masters > 1 {
            return Err(StreamError::InvalidConfig(format!(
                "only one master device allowed, got {}",
                masters
            )));
        }
        Ok(Self {
            sources,
            pending: Vec::new(),
            specials: SpecialQueue::default(),
            watermark: None,
            last_delivered: None,
            started: false,
        })
    }

    /// Number of merged sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Always false; a merger owns at least one source.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Events received but not yet released.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Watermark of the last poll that released events. `u64::MAX` once
    /// every source is exhausted.
    pub fn common_time(&self) -> Option<u64> {
        self.watermark
    }

    /// Order in which sources are started: slaves, then the master, then
    /// unsynchronised sources.
    fn start_order(&self) -> Vec<usize> {
        let rank = |role: SyncRole| match role {
            SyncRole::Slave => 0,
            SyncRole::Master => 1,
            SyncRole::Standalone => 2,
        };
        let mut order: Vec<usize> = (0..self.sources.len()).collect();
        order.sort_by_key(|&i| rank(self.sources[i].sync_role()));
        order
    }

    /// Current watermark, `None` while some live source has not delivered yet.
    fn current_watermark(&self) -> Option<u64> {
        let mut watermark = u64::MAX;
        for source in &self.sources {
            if source.is_exhausted() {
                continue;
            }
            watermark = watermark.min(source.last_delivered()?);
        }
        Some(watermark)
    }
}

impl EventSource for StreamMerger {
    fn poll(&mut self) -> Result<Vec<Event>, StreamError> {
        for (id, source) in self.sources.iter_mut().enumerate() {
            let events = source.poll()?;
            // MAX_SOURCES keeps the index within u8
            let id = id as u8;
            self.pending
                .extend(events.into_iter().map(|e| Event { id, ..e }));
            self.specials
                .extend(source.take_specials().into_iter().map(|b| b.with_id(id)));
        }

        let Some(watermark) = self.current_watermark() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        self.pending.sort_by_key(|e| (e.timestamp, e.id));
        let split = self.pending.partition_point(|e| e.timestamp <= watermark);
        let retained = self.pending.split_off(split);
        let released = std::mem::replace(&mut self.pending, retained);

        if let (Some(first), Some(last)) = (released.first(), released.last()) {
            if self.last_delivered.is_some_and(|t| first.timestamp < t) {
                warn!(
                    timestamp = first.timestamp,
                    "released event behind previous common time"
                );
            }
            self.watermark = Some(watermark);
            self.last_delivered = Some(last.timestamp);
            debug!(
                released = released.len(),
                retained = self.pending.len(),
                watermark,
                "merged poll"
            );
        }
        Ok(released)
    }

    fn last_delivered(&self) -> Option<u64> {
        self.last_delivered
    }

    fn is_exhausted(&self) -> bool {
        self.pending.is_empty() && self.sources.iter().all(|s| s.is_exhausted())
    }

    /// Special blocks of all sources in arrival order, not held back by the
    /// watermark.
    fn take_specials(&mut self) -> Vec<SpecialBlock> {
        self.specials.take()
    }

    fn start(&mut self) -> Result<(), StreamError> {
        if self.started {
            return Ok(());
        }
        for i in self.start_order() {
            debug!(source = i, role = ?self.sources[i].sync_role(), "starting source");
            self.sources[i].start()?;
        }
        self.started = true;
        info!(sources = self.sources.len(), "merger started");
        Ok(())
    }

    fn write(&mut self, command: &str) -> Result<(), StreamError> {
        let mut written = 0;
        for source in &mut self.sources {
            match source.write(command) {
                Ok(()) => written += 1,
                Err(StreamError::NotWritable) => {}
                Err(e) => return Err(e),
            }
        }
        if written == 0 {
            return Err(StreamError::NotWritable);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        let mut first_error = None;
        for source in &mut self.sources {
            if let Err(e) = source.stop() {
                warn!(error = %e, "failed to stop source");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
