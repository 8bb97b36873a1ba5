//! Live segmentation of a model's token stream.
//!
//! Raw chunks pass through [`ThinkingExtractor`] first; its visible channel
//! then feeds [`ToolBlockExtractor`], so the caller only ever sees reply text
//! with both thinking markup and tool-call directives removed. Both stages
//! withhold a small tail between chunks and never drop text at stream end.

pub mod thinking;
pub mod tool_blocks;

pub use thinking::{ThinkingDelta, ThinkingExtractor, ThinkingState, THINKING_SAFETY_TAIL};
pub use tool_blocks::{ToolBlockDelta, ToolBlockExtractor, TOOL_BLOCK_TAIL_LIMIT};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentDelta {
    pub visible: String,
    pub thinking: String,
    pub blocks: Vec<String>,
}

impl SegmentDelta {
    pub fn is_empty(&self) -> bool {
        self.visible.is_empty() && self.thinking.is_empty() && self.blocks.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct StreamSegmenter {
    thinking: ThinkingExtractor,
    tool_blocks: ToolBlockExtractor,
}

impl StreamSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> SegmentDelta {
        let thinking = self.thinking.push(chunk);
        let blocks = self.tool_blocks.push(&thinking.visible);
        SegmentDelta {
            visible: blocks.visible,
            thinking: thinking.thinking,
            blocks: blocks.blocks,
        }
    }

    pub fn flush(&mut self) -> SegmentDelta {
        let thinking = self.thinking.flush();
        let mut tail = self.tool_blocks.push(&thinking.visible);
        let flushed = self.tool_blocks.flush();
        tail.visible.push_str(&flushed.visible);
        tail.blocks.extend(flushed.blocks);
        SegmentDelta {
            visible: tail.visible,
            thinking: thinking.thinking,
            blocks: tail.blocks,
        }
    }

    /// Reply text with thinking and directive blocks removed.
    pub fn visible(&self) -> &str {
        self.tool_blocks.visible()
    }

    pub fn thinking(&self) -> &str {
        self.thinking.thinking()
    }

    pub fn blocks(&self) -> &[String] {
        self.tool_blocks.blocks()
    }

    pub fn unterminated_block(&self) -> Option<&str> {
        self.tool_blocks.unterminated_block()
    }
}
