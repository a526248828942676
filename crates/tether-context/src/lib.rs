//! Context window selection.
//!
//! Turns an unbounded conversation history into a token-budgeted message
//! window. Selection is a read-time projection: the walk starts from the most
//! recent message and moves backward, never splitting an assistant/tool call
//! group and always anchoring the window on a user message. Dropped prefix
//! messages can be folded into a synthetic summary by an optional
//! summarization collaborator.

use tether_core::{ContextConfig, Message, estimate_messages, estimate_text};

/// Token budget for one context build.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub total_capacity: u64,
    pub reserved_for_tools: u64,
    /// Fraction of remaining capacity allotted to history.
    pub target_fraction: f64,
}

impl From<&ContextConfig> for ContextBudget {
    fn from(cfg: &ContextConfig) -> Self {
        Self {
            total_capacity: cfg.context_window_tokens,
            reserved_for_tools: cfg.reserved_for_tools,
            target_fraction: cfg.target_fraction,
        }
    }
}

/// Optional collaborator folding dropped messages into a short synopsis.
/// Failure is non-fatal; the build simply omits the summary.
pub trait Summarizer {
    fn summarize(&self, dropped: &[Message]) -> anyhow::Result<String>;
}

/// Result of one context build.
#[derive(Debug, Clone)]
pub struct BuiltContext {
    /// The system preamble, unmodified.
    pub system: String,
    /// Selected history window (most recent suffix of the conversation).
    pub selected: Vec<Message>,
    /// Synopsis of the dropped prefix, when a summarizer was available and
    /// succeeded.
    pub summary: Option<String>,
    /// Number of history messages dropped by the walk.
    pub dropped: usize,
    /// The selection exceeds the history limit (the latest user turn alone
    /// was too large to fit).
    pub budget_exceeded: bool,
    /// The preamble alone exceeds total capacity; the selection is empty.
    pub preamble_overflow: bool,
    /// Estimated token cost of the selected window.
    pub estimated_tokens: u64,
}

/// Group history into selection units: a standalone message, or an assistant
/// message bearing tool calls together with the tool results that follow it.
fn group_units(history: &[Message]) -> Vec<std::ops::Range<usize>> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < history.len() {
        let start = i;
        i += 1;
        if !history[start].tool_calls().is_empty() {
            while i < history.len() && history[i].is_tool() {
                i += 1;
            }
        }
        units.push(start..i);
    }
    units
}

/// Build a bounded context window over `history`.
pub fn build_context(
    preamble: &str,
    history: &[Message],
    budget: &ContextBudget,
    summarizer: Option<&dyn Summarizer>,
) -> BuiltContext {
    let preamble_cost = estimate_text(preamble);
    if preamble_cost > budget.total_capacity {
        return BuiltContext {
            system: preamble.to_string(),
            selected: Vec::new(),
            summary: None,
            dropped: history.len(),
            budget_exceeded: true,
            preamble_overflow: true,
            estimated_tokens: 0,
        };
    }

    let reserved = preamble_cost + budget.reserved_for_tools;
    let remaining = budget.total_capacity.saturating_sub(reserved);
    let limit = (remaining as f64 * budget.target_fraction.clamp(0.0, 1.0)) as u64;

    let units = group_units(history);
    if units.is_empty() {
        return BuiltContext {
            system: preamble.to_string(),
            selected: Vec::new(),
            summary: None,
            dropped: 0,
            budget_exceeded: false,
            preamble_overflow: false,
            estimated_tokens: 0,
        };
    }
    let unit_costs: Vec<u64> = units
        .iter()
        .map(|r| estimate_messages(&history[r.clone()]))
        .collect();

    // Walk whole units backward from the most recent, stopping before the
    // limit. Unit granularity is what keeps tool-call groups intact: a group
    // is either included with all its results or dropped entirely.
    let mut start_unit = units.len();
    let mut used: u64 = 0;
    while start_unit > 0 {
        let cost = unit_costs[start_unit - 1];
        if used + cost > limit {
            break;
        }
        used += cost;
        start_unit -= 1;
    }

    // Anchor the window on a user message. When nothing fit, or the cut
    // landed on an assistant/tool unit, extend backward to the nearest user
    // unit and accept exceeding the limit rather than sending an empty or
    // orphaned window.
    let starts_with_user =
        start_unit < units.len() && history[units[start_unit].start].is_user();
    if !starts_with_user {
        let mut anchor = start_unit.min(units.len() - 1);
        while anchor > 0 && !history[units[anchor].start].is_user() {
            anchor -= 1;
        }
        if history[units[anchor].start].is_user() {
            start_unit = anchor;
        } else {
            // Malformed prefix with no user message at all: skip leading
            // tool units so the window never opens on a tool result.
            start_unit = start_unit.min(units.len() - 1);
            while start_unit < units.len() && history[units[start_unit].start].is_tool() {
                start_unit += 1;
            }
        }
        used = unit_costs[start_unit..].iter().sum();
    }

    let cut = units
        .get(start_unit)
        .map(|r| r.start)
        .unwrap_or(history.len());
    let selected: Vec<Message> = history[cut..].to_vec();
    let dropped = cut;

    let summary = if dropped > 0 {
        summarizer.and_then(|s| s.summarize(&history[..cut]).ok())
    } else {
        None
    };

    BuiltContext {
        system: preamble.to_string(),
        selected,
        summary,
        dropped,
        budget_exceeded: used > limit,
        preamble_overflow: false,
        estimated_tokens: used,
    }
}

/// Deterministic fallback summarizer: a truncating transcript digest, usable
/// when no model-backed summarizer is wired in.
#[derive(Debug, Clone)]
pub struct TranscriptSummarizer {
    /// Entries beyond this count are elided from the middle.
    pub max_entries: usize,
}

impl Default for TranscriptSummarizer {
    fn default() -> Self {
        Self { max_entries: 30 }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}...")
}

impl Summarizer for TranscriptSummarizer {
    fn summarize(&self, dropped: &[Message]) -> anyhow::Result<String> {
        use tether_core::{MessageBody, UserContent};

        let mut entries: Vec<String> = Vec::new();
        for msg in dropped {
            match &msg.body {
                MessageBody::User { content } => {
                    let text = match content {
                        UserContent::Text(text) => text.clone(),
                        UserContent::Parts(parts) => format!("[{} content parts]", parts.len()),
                    };
                    entries.push(format!("- User: {}", truncate_chars(&text, 200)));
                }
                MessageBody::Assistant {
                    content,
                    tool_calls,
                    ..
                } => {
                    if let Some(text) = content
                        && !text.is_empty()
                    {
                        entries.push(format!("- Assistant: {}", truncate_chars(text, 200)));
                    }
                    for tc in tool_calls {
                        entries.push(format!(
                            "- Tool call: {}({})",
                            tc.name,
                            truncate_chars(&tc.arguments, 80)
                        ));
                    }
                }
                MessageBody::Tool { content, .. } => {
                    entries.push(format!("- Tool result: {}", truncate_chars(content, 100)));
                }
            }
        }

        if entries.len() > self.max_entries {
            let half = self.max_entries / 2;
            let omitted = entries.len() - half * 2;
            let head = entries[..half].join("\n");
            let tail = entries[entries.len() - half..].join("\n");
            Ok(format!("{head}\n... ({omitted} entries omitted) ...\n{tail}"))
        } else {
            Ok(entries.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tether_core::{Message, ToolCallRequest, pairing_violation};

    fn call(id: &str, args_len: usize) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: "fs_read".to_string(),
            arguments: format!("{{\"path\":\"{}\"}}", "x".repeat(args_len)),
        }
    }

    fn budget(total: u64) -> ContextBudget {
        ContextBudget {
            total_capacity: total,
            reserved_for_tools: 0,
            target_fraction: 1.0,
        }
    }

    fn sample_history() -> Vec<Message> {
        vec![
            Message::user("first question about the project layout"),
            Message::assistant(Some("first answer with some detail".into()), None, vec![]),
            Message::user("read the main file"),
            Message::assistant(None, None, vec![call("c1", 10)]),
            Message::tool_result("c1", "file contents here"),
            Message::assistant(Some("summary of the file".into()), None, vec![]),
            Message::user("now list the tests"),
        ]
    }

    #[test]
    fn large_budget_selects_everything_verbatim() {
        let history = sample_history();
        let built = build_context("system", &history, &budget(1_000_000), None);
        assert_eq!(built.selected, history);
        assert_eq!(built.dropped, 0);
        assert!(!built.budget_exceeded);
        assert!(built.summary.is_none());
    }

    #[test]
    fn small_budget_keeps_latest_user_turn_and_flags_overrun() {
        let history = sample_history();
        let built = build_context("system", &history, &budget(10), None);
        assert!(!built.selected.is_empty());
        assert!(built.selected[0].is_user());
        assert!(built.budget_exceeded);
    }

    #[test]
    fn selection_never_opens_inside_a_tool_group() {
        let history = sample_history();
        // Sweep budgets; at every size the window must start on a user
        // message and keep tool groups whole.
        for total in (5..400).step_by(7) {
            let built = build_context("sys", &history, &budget(total), None);
            if let Some(first) = built.selected.first() {
                assert!(first.is_user(), "budget {total} started on non-user");
            }
            assert_eq!(
                pairing_violation(&built.selected),
                None,
                "budget {total} split a group"
            );
        }
    }

    #[test]
    fn preamble_overflow_returns_empty_selection() {
        let history = sample_history();
        let huge_preamble = "word ".repeat(5_000);
        let built = build_context(&huge_preamble, &history, &budget(100), None);
        assert!(built.preamble_overflow);
        assert!(built.selected.is_empty());
        assert_eq!(built.system, huge_preamble);
    }

    #[test]
    fn dropped_prefix_is_summarized() {
        let history = sample_history();
        let summarizer = TranscriptSummarizer::default();
        let built = build_context("sys", &history, &budget(40), Some(&summarizer));
        assert!(built.dropped > 0);
        let summary = built.summary.expect("summary");
        assert!(summary.contains("User:"));
    }

    #[test]
    fn summarizer_failure_is_non_fatal() {
        struct Failing;
        impl Summarizer for Failing {
            fn summarize(&self, _dropped: &[Message]) -> anyhow::Result<String> {
                anyhow::bail!("summarizer unavailable")
            }
        }
        let history = sample_history();
        let built = build_context("sys", &history, &budget(40), Some(&Failing));
        assert!(built.dropped > 0);
        assert!(built.summary.is_none());
    }

    #[test]
    fn empty_history_yields_empty_selection() {
        let built = build_context("sys", &[], &budget(100), None);
        assert!(built.selected.is_empty());
        assert_eq!(built.dropped, 0);
        assert!(!built.budget_exceeded);
    }

    #[test]
    fn transcript_digest_elides_long_middles() {
        let mut history = Vec::new();
        for i in 0..40 {
            history.push(Message::user(format!("question number {i}")));
        }
        let digest = TranscriptSummarizer::default()
            .summarize(&history)
            .expect("digest");
        assert!(digest.contains("entries omitted"));
        assert!(digest.contains("question number 0"));
        assert!(digest.contains("question number 39"));
    }

    // ── Property tests over generated histories ──

    fn arb_turn() -> impl Strategy<Value = Vec<Message>> {
        (
            "[a-z ]{1,40}",
            proptest::option::of(("[a-z ]{0,40}", 0_usize..3)),
        )
            .prop_map(|(user_text, assistant)| {
                let mut turn = vec![Message::user(user_text)];
                if let Some((answer, call_count)) = assistant {
                    if call_count > 0 {
                        let calls: Vec<ToolCallRequest> =
                            (0..call_count).map(|i| call(&format!("c{i}"), 8)).collect();
                        let ids: Vec<String> = calls.iter().map(|c| c.id.clone()).collect();
                        turn.push(Message::assistant(None, None, calls));
                        for id in ids {
                            turn.push(Message::tool_result(id, "tool output"));
                        }
                    }
                    turn.push(Message::assistant(Some(answer), None, vec![]));
                }
                turn
            })
    }

    fn arb_history() -> impl Strategy<Value = Vec<Message>> {
        proptest::collection::vec(arb_turn(), 1..6).prop_map(|turns| turns.concat())
    }

    proptest! {
        #[test]
        fn window_is_always_well_paired(history in arb_history(), total in 5_u64..2_000) {
            let built = build_context("sys", &history, &budget(total), None);
            if let Some(first) = built.selected.first() {
                prop_assert!(!first.is_tool());
            }
            prop_assert_eq!(pairing_violation(&built.selected), None);
        }

        #[test]
        fn bigger_budgets_select_recency_supersets(history in arb_history(), b1 in 5_u64..500, extra in 1_u64..1_500) {
            let small = build_context("sys", &history, &budget(b1), None);
            let large = build_context("sys", &history, &budget(b1 + extra), None);
            prop_assert!(large.selected.len() >= small.selected.len());
            // Both are suffixes of the same history, so the smaller selection
            // must be the tail of the larger one.
            let offset = large.selected.len() - small.selected.len();
            prop_assert_eq!(&large.selected[offset..], &small.selected[..]);
        }
    }
}
