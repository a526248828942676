//! Token estimation.
//!
//! A pure, deterministic heuristic approximating BPE tokenizer behavior,
//! cheap enough to run over the full history on every context rebuild. BPE
//! tokenizers split at whitespace and character-class boundaries and merge
//! frequent byte pairs; this models that by costing maximal same-class
//! character runs:
//!
//! - whitespace run: 1 token
//! - alphabetic run: 1 token up to 6 chars, then ~1 per 4 chars
//! - digit run: ~1 per 3 chars
//! - ASCII punctuation/operator run: 1 per char
//! - non-ASCII run (CJK, emoji, accents): ~3 per 4 chars
//!
//! Each run's cost is non-decreasing in its length and appending text only
//! extends the final run or adds new ones, so the estimate is monotonic:
//! more text never yields a lower estimate.

use crate::message::{ContentPart, Message, MessageBody, UserContent};

/// Fixed framing overhead per message (role, delimiters).
const MESSAGE_OVERHEAD: u64 = 4;

/// Flat cost charged for any image part, independent of size.
const IMAGE_BASE_TOKENS: u64 = 85;

/// Additional image cost: one token per this many base64 characters.
const IMAGE_BASE64_CHARS_PER_TOKEN: u64 = 16;

#[derive(Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Whitespace,
    Alpha,
    Digit,
    Punct,
    Other,
}

fn classify(c: char) -> CharClass {
    if c.is_whitespace() {
        CharClass::Whitespace
    } else if c.is_ascii_alphabetic() {
        CharClass::Alpha
    } else if c.is_ascii_digit() {
        CharClass::Digit
    } else if c.is_ascii() {
        CharClass::Punct
    } else {
        CharClass::Other
    }
}

fn run_cost(class: CharClass, len: u64) -> u64 {
    match class {
        CharClass::Whitespace => 1,
        CharClass::Alpha => {
            if len <= 6 {
                1
            } else {
                len.div_ceil(4)
            }
        }
        CharClass::Digit => len.div_ceil(3),
        CharClass::Punct => len,
        CharClass::Other => (len * 3).div_ceil(4).max(1),
    }
}

/// Estimate the token cost of a text fragment.
#[must_use]
pub fn estimate_text(text: &str) -> u64 {
    let mut tokens = 0;
    let mut run: Option<(CharClass, u64)> = None;

    for c in text.chars() {
        let class = classify(c);
        match run {
            Some((current, len)) if current == class => run = Some((current, len + 1)),
            Some((current, len)) => {
                tokens += run_cost(current, len);
                run = Some((class, 1));
            }
            None => run = Some((class, 1)),
        }
    }
    if let Some((class, len)) = run {
        tokens += run_cost(class, len);
    }
    tokens
}

fn estimate_part(part: &ContentPart) -> u64 {
    match part {
        ContentPart::Text { text } => estimate_text(text),
        ContentPart::Image { base64_data, .. } => {
            IMAGE_BASE_TOKENS + (base64_data.len() as u64) / IMAGE_BASE64_CHARS_PER_TOKEN
        }
    }
}

/// Estimate the token cost of one message, including framing overhead.
///
/// Assistant reasoning is excluded: prior-turn reasoning is not replayed to
/// the transport, so it never occupies context budget.
#[must_use]
pub fn estimate_message(message: &Message) -> u64 {
    MESSAGE_OVERHEAD
        + match &message.body {
            MessageBody::User { content } => match content {
                UserContent::Text(text) => estimate_text(text),
                UserContent::Parts(parts) => parts.iter().map(estimate_part).sum(),
            },
            MessageBody::Assistant {
                content,
                tool_calls,
                ..
            } => {
                let text = content.as_deref().map(estimate_text).unwrap_or(0);
                let calls: u64 = tool_calls
                    .iter()
                    .map(|tc| estimate_text(&tc.name) + estimate_text(&tc.arguments))
                    .sum();
                text + calls
            }
            MessageBody::Tool { content, .. } => estimate_text(content),
        }
}

/// Estimate the total token cost of a message sequence.
#[must_use]
pub fn estimate_messages(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message).sum()
}
