//! Incremental extraction of inline `<tool_call>` directive blocks.

/// Upper bound on a withheld partial opening tag.
pub const TOOL_BLOCK_TAIL_LIMIT: usize = 24;

/// Recognised (opening, closing) tag pairs, lowercase. `<mcp_call>` is the
/// legacy spelling.
const TOOL_BLOCK_TAGS: &[(&str, &str)] = &[
    ("<tool_call>", "</tool_call>"),
    ("<mcp_call>", "</mcp_call>"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolBlockDelta {
    pub visible: String,
    pub blocks: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ToolBlockExtractor {
    pending: String,
    visible: String,
    blocks: Vec<String>,
    unterminated: Option<String>,
}

impl ToolBlockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visible(&self) -> &str {
        &self.visible
    }

    /// Complete blocks in document order.
    pub fn blocks(&self) -> &[String] {
        &self.blocks
    }

    /// Interior of a block whose closing tag never arrived; only set by
    /// [`ToolBlockExtractor::flush`].
    pub fn unterminated_block(&self) -> Option<&str> {
        self.unterminated.as_deref()
    }

    pub fn push(&mut self, chunk: &str) -> ToolBlockDelta {
        self.pending.push_str(chunk);
        let mut delta = ToolBlockDelta::default();

        loop {
            // ASCII lowercasing keeps byte offsets identical to `pending`.
            let lower = self.pending.to_ascii_lowercase();
            match find_opening_tag(&lower) {
                Some((start, open, close)) => {
                    let body_start = start + open.len();
                    delta.visible.push_str(&self.pending[..start]);
                    match lower[body_start..].find(close) {
                        Some(relative_end) => {
                            let body_end = body_start + relative_end;
                            delta
                                .blocks
                                .push(self.pending[body_start..body_end].to_string());
                            self.pending.drain(..body_end + close.len());
                        }
                        None => {
                            self.pending.drain(..start);
                            break;
                        }
                    }
                }
                None => {
                    let hold_from = partial_tag_start(&lower).unwrap_or(lower.len());
                    delta.visible.push_str(&self.pending[..hold_from]);
                    self.pending.drain(..hold_from);
                    break;
                }
            }
        }

        self.record(&delta);
        delta
    }

    /// Ends the stream. Anything still withheld (a partial opening tag or an
    /// unterminated block) is released verbatim as visible text.
    pub fn flush(&mut self) -> ToolBlockDelta {
        let remaining = std::mem::take(&mut self.pending);
        let lower = remaining.to_ascii_lowercase();
        if let Some((0, open, _)) = find_opening_tag(&lower) {
            self.unterminated = Some(remaining[open.len()..].to_string());
        }
        let delta = ToolBlockDelta {
            visible: remaining,
            blocks: Vec::new(),
        };
        self.record(&delta);
        delta
    }

    fn record(&mut self, delta: &ToolBlockDelta) {
        self.visible.push_str(&delta.visible);
        self.blocks.extend(delta.blocks.iter().cloned());
    }
}

fn find_opening_tag(lower: &str) -> Option<(usize, &'static str, &'static str)> {
    TOOL_BLOCK_TAGS
        .iter()
        .filter_map(|(open, close)| lower.find(open).map(|position| (position, *open, *close)))
        .min_by_key(|(position, _, _)| *position)
}

/// Start of a trailing fragment that could still grow into an opening tag.
fn partial_tag_start(lower: &str) -> Option<usize> {
    let position = lower.rfind('<')?;
    let fragment = &lower[position..];
    if fragment.len() > TOOL_BLOCK_TAIL_LIMIT {
        return None;
    }
    TOOL_BLOCK_TAGS
        .iter()
        .any(|(open, _)| open.len() > fragment.len() && open.starts_with(fragment))
        .then_some(position)
}
