//! # Collapsing
//! Folds bursts of same-source events into a single display group.
//!
//! Input must already be ordered newest-first (the store's `events()` query
//! guarantees this). The scan keeps at most one open group per source; an
//! event joins the open group when its gap to the group's most recently folded
//! member is within the source's window, otherwise the group is closed and the
//! event starts a new one. Closed groups take the slot of their oldest member.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::model::{EventRecord, SourceRecord, DEFAULT_COLLAPSE_INTERVAL_SECS};

/// A folded burst of events from one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventGroup {
    pub source: String,
    pub kind: String,
    /// Timestamp of the newest child.
    pub timestamp: i64,
    /// Newest first.
    pub children: Vec<EventRecord>,
}

/// One row of collapsed output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DisplayItem {
    Event(EventRecord),
    Group(EventGroup),
}

impl DisplayItem {
    pub fn timestamp(&self) -> i64 {
        match self {
            DisplayItem::Event(e) => e.timestamp,
            DisplayItem::Group(g) => g.timestamp,
        }
    }

    pub fn as_group(&self) -> Option<&EventGroup> {
        match self {
            DisplayItem::Group(g) => Some(g),
            DisplayItem::Event(_) => None,
        }
    }
}

#[derive(Debug)]
struct OpenGroup {
    group: EventGroup,
    /// Timestamp of the last folded member; gaps are measured from here.
    last_timestamp: i64,
    /// Input index of the last folded member.
    anchor: usize,
}

/// Scan state: one open group (or none) per source, plus the output slots.
#[derive(Debug)]
struct Collapser {
    open: HashMap<String, OpenGroup>,
    slots: Vec<Option<DisplayItem>>,
}

impl Collapser {
    fn new(len: usize) -> Self {
        Self {
            open: HashMap::new(),
            slots: Vec::with_capacity(len),
        }
    }

    fn pass_through(&mut self, event: EventRecord) {
        self.slots.push(Some(DisplayItem::Event(event)));
    }

    fn fold(&mut self, index: usize, event: EventRecord, interval: i64) {
        // The folded event's own slot stays empty unless the group lands there.
        self.slots.push(None);

        let expired = self
            .open
            .get(&event.source)
            .is_some_and(|open| open.last_timestamp - event.timestamp > interval);
        if expired {
            let closed = self.open.remove(&event.source);
            self.close(closed);
        }

        let open = self
            .open
            .entry(event.source.clone())
            .or_insert_with(|| OpenGroup {
                group: EventGroup {
                    source: event.source.clone(),
                    kind: event.kind.clone(),
                    timestamp: event.timestamp,
                    children: Vec::new(),
                },
                last_timestamp: event.timestamp,
                anchor: index,
            });
        open.last_timestamp = event.timestamp;
        open.anchor = index;
        open.group.children.push(event);
    }

    fn close(&mut self, open: Option<OpenGroup>) {
        if let Some(open) = open {
            self.slots[open.anchor] = Some(DisplayItem::Group(open.group));
        }
    }

    fn finish(mut self) -> Vec<DisplayItem> {
        let remaining: Vec<OpenGroup> = self.open.drain().map(|(_, g)| g).collect();
        for open in remaining {
            self.close(Some(open));
        }
        self.slots.into_iter().flatten().collect()
    }
}

/// Window for `event`, or `None` when neither its source nor the event asks
/// for collapsing.
fn collapse_interval(
    event: &EventRecord,
    sources: &BTreeMap<String, SourceRecord>,
) -> Option<i64> {
    let source_window = sources
        .get(&event.source)
        .and_then(|s| s.collapse)
        .and_then(|c| c.interval());
    match source_window {
        Some(w) => Some(w),
        None if event.collapse.unwrap_or(false) => Some(DEFAULT_COLLAPSE_INTERVAL_SECS),
        None => None,
    }
}

/// Collapse a newest-first event list using each source's policy.
pub fn collapse_events(
    events: Vec<EventRecord>,
    sources: &BTreeMap<String, SourceRecord>,
) -> Vec<DisplayItem> {
    let mut state = Collapser::new(events.len());
    for (index, event) in events.into_iter().enumerate() {
        match collapse_interval(&event, sources) {
            Some(interval) => state.fold(index, event, interval),
            None => state.pass_through(event),
        }
    }
    state.finish()
}
