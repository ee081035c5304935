//! Completion-marker detection over streamed assistant text.
//!
//! The build loop decides continue/stop/escalate from exact-substring
//! tokens the agent embeds in its text output. Text arrives in arbitrary
//! chunks, so detection runs over a bounded rolling buffer.

use serde::{Deserialize, Serialize};

/// Token the agent emits when the current work item is done.
pub const ITEM_COMPLETE_MARKER: &str = "<drover:item-complete/>";

/// Token the agent emits when every work item is done.
pub const ALL_COMPLETE_MARKER: &str = "<drover:all-complete/>";

/// Marker kind detected in assistant text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMarker {
    Item,
    All,
}

/// Buffer growth limit before the head is discarded.
const BUFFER_LIMIT: usize = 4096;

/// Trailing window kept on truncation. Must exceed the longest marker so
/// an in-progress partial marker survives the cut.
const TAIL_WINDOW: usize = 256;

/// Bounded rolling buffer that detects markers spanning chunk boundaries.
///
/// Matched text is consumed through the end of the last fired marker, so
/// overlapping content can never fire twice while a partial marker that
/// arrived after the hit keeps accumulating.
#[derive(Debug, Default)]
pub struct MarkerBuffer {
    buf: String,
}

impl MarkerBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a text chunk and returns every marker completed by it, in
    /// the order they appear.
    pub fn push(&mut self, chunk: &str) -> Vec<CompletionMarker> {
        self.buf.push_str(chunk);

        let mut hits = Vec::new();
        let mut scan_from = 0usize;
        loop {
            match next_marker(&self.buf[scan_from..]) {
                Some((offset, len, marker)) => {
                    hits.push(marker);
                    scan_from += offset + len;
                }
                None => break,
            }
        }

        if !hits.is_empty() {
            self.buf.drain(..scan_from);
        }
        if self.buf.len() > BUFFER_LIMIT {
            let mut cut = self.buf.len() - TAIL_WINDOW;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }

        hits
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

fn next_marker(haystack: &str) -> Option<(usize, usize, CompletionMarker)> {
    let item = haystack.find(ITEM_COMPLETE_MARKER);
    let all = haystack.find(ALL_COMPLETE_MARKER);
    match (item, all) {
        (None, None) => None,
        (Some(i), None) => Some((i, ITEM_COMPLETE_MARKER.len(), CompletionMarker::Item)),
        (None, Some(a)) => Some((a, ALL_COMPLETE_MARKER.len(), CompletionMarker::All)),
        (Some(i), Some(a)) => {
            if a < i {
                Some((a, ALL_COMPLETE_MARKER.len(), CompletionMarker::All))
            } else {
                Some((i, ITEM_COMPLETE_MARKER.len(), CompletionMarker::Item))
            }
        }
    }
}
