//! Markdown code extraction for assistant replies.
//!
//! Only the first fenced block is deployed: generated apps are single-file,
//! and later blocks in a reply are usually usage notes or shell snippets.

use regex::Regex;
use std::sync::LazyLock;

/// Matches a complete fenced block. Lazy so the first closing fence wins;
/// an opening fence without a closing one never matches.
static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(.*?)```").expect("fenced block regex is valid"));

/// A fenced code block pulled out of a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// Language tag from the opening fence (`python` in ```` ```python ````).
    pub language: Option<String>,
    /// Inner text with the tag line removed and surrounding whitespace trimmed.
    pub code: String,
}

/// Return the trimmed contents of the first fenced block in `text`, or an
/// empty string when there is none.
pub fn extract(text: &str) -> String {
    first_code_block(text)
        .map(|block| block.code)
        .unwrap_or_default()
}

/// Return the first fenced block in `text`, if any.
pub fn first_code_block(text: &str) -> Option<CodeBlock> {
    let inner = FENCED_BLOCK.captures(text)?.get(1)?.as_str();
    Some(split_info_string(inner))
}

/// Number of complete fenced blocks in `text`.
pub fn count_code_blocks(text: &str) -> usize {
    FENCED_BLOCK.find_iter(text).count()
}

fn split_info_string(inner: &str) -> CodeBlock {
    // ```print(1)``` has no tag line; everything between the fences is code.
    let Some((first_line, rest)) = inner.split_once('\n') else {
        return CodeBlock {
            language: None,
            code: inner.trim().to_string(),
        };
    };

    let language = first_line
        .split_whitespace()
        .next()
        .map(str::to_string);

    CodeBlock {
        language,
        code: rest.trim().to_string(),
    }
}
