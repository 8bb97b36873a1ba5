//! Incremental extraction of `<thinking>` blocks from streamed model text.

/// Number of trailing characters withheld after each chunk. Must be at least
/// as long as the longest marker so a marker split across chunks is never
/// emitted half-way.
pub const THINKING_SAFETY_TAIL: usize = 12;

/// Accepted (opening, closing) marker spellings.
const THINKING_MARKERS: &[(&str, &str)] = &[("<thinking>", "</thinking>"), ("<think>", "</think>")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingState {
    #[default]
    Visible,
    Thinking,
}

/// Text released by a single [`ThinkingExtractor::push`] or
/// [`ThinkingExtractor::flush`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThinkingDelta {
    pub visible: String,
    pub thinking: String,
}

impl ThinkingDelta {
    pub fn is_empty(&self) -> bool {
        self.visible.is_empty() && self.thinking.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ThinkingExtractor {
    state: ThinkingState,
    active_close: Option<&'static str>,
    pending: String,
    visible: String,
    thinking: String,
}

impl ThinkingExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ThinkingState {
        self.state
    }

    /// Everything emitted to the visible channel so far.
    pub fn visible(&self) -> &str {
        &self.visible
    }

    /// Everything emitted to the thinking channel so far.
    pub fn thinking(&self) -> &str {
        &self.thinking
    }

    pub fn push(&mut self, chunk: &str) -> ThinkingDelta {
        self.pending.push_str(chunk);
        let mut delta = ThinkingDelta::default();

        loop {
            match self.state {
                ThinkingState::Visible => {
                    if let Some((position, open, close)) = find_opening_marker(&self.pending) {
                        delta.visible.push_str(&self.pending[..position]);
                        self.pending.drain(..position + open.len());
                        self.state = ThinkingState::Thinking;
                        self.active_close = Some(close);
                        continue;
                    }
                }
                ThinkingState::Thinking => {
                    let close = self.active_close.unwrap_or(THINKING_MARKERS[0].1);
                    if let Some(position) = self.pending.find(close) {
                        delta.thinking.push_str(&self.pending[..position]);
                        self.pending.drain(..position + close.len());
                        self.state = ThinkingState::Visible;
                        self.active_close = None;
                        continue;
                    }
                }
            }

            let split = safe_split_index(&self.pending, THINKING_SAFETY_TAIL);
            let released: String = self.pending.drain(..split).collect();
            self.route(&mut delta, &released);
            break;
        }

        self.record(&delta);
        delta
    }

    /// Releases the withheld tail to whichever channel matches the current
    /// state.
    pub fn flush(&mut self) -> ThinkingDelta {
        let mut delta = ThinkingDelta::default();
        let remaining = std::mem::take(&mut self.pending);
        self.route(&mut delta, &remaining);
        self.record(&delta);
        delta
    }

    fn route(&self, delta: &mut ThinkingDelta, text: &str) {
        match self.state {
            ThinkingState::Visible => delta.visible.push_str(text),
            ThinkingState::Thinking => delta.thinking.push_str(text),
        }
    }

    fn record(&mut self, delta: &ThinkingDelta) {
        self.visible.push_str(&delta.visible);
        self.thinking.push_str(&delta.thinking);
    }
}

fn find_opening_marker(text: &str) -> Option<(usize, &'static str, &'static str)> {
    THINKING_MARKERS
        .iter()
        .filter_map(|(open, close)| text.find(open).map(|position| (position, *open, *close)))
        .min_by_key(|(position, _, _)| *position)
}

/// Byte index that leaves the last `tail_chars` characters of `text` unreleased.
pub(crate) fn safe_split_index(text: &str, tail_chars: usize) -> usize {
    if tail_chars == 0 {
        return text.len();
    }
    text.char_indices()
        .rev()
        .nth(tail_chars - 1)
        .map(|(index, _)| index)
        .unwrap_or(0)
}
