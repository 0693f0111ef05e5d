//! Per-turn context budget: estimate, and trim lowest-priority text first.
//!
//! A turn's prompt is assembled from four parts: system prompt, skills,
//! conversation history and the user's message. When their estimated size
//! exceeds the available budget, [`ContextBudgetManager::check_and_trim`]
//! trims in a fixed order, re-estimating after each step:
//!
//! 1. skills, cut to [`ContextBudgetConfig::skills_cap_tokens`];
//! 2. history, keeping the newest suffix;
//! 3. system prompt, keeping head and tail and eliding the middle.
//!
//! The user message is never touched.

use serde::Serialize;
use tracing::{debug, warn};

/// Default context window in tokens.
pub const DEFAULT_TOTAL_LIMIT: usize = 128_000;

const HISTORY_MARKER: &str = "[earlier conversation trimmed]\n";
const SKILLS_MARKER: &str = "\n[skills truncated]";
const SYSTEM_MARKER: &str = "\n[... system prompt trimmed ...]\n";

/// Weights are counted in sixths of a token so sums stay exact.
const UNITS_PER_TOKEN: usize = 6;

/// Estimated tokens for `text`.
///
/// Conservative per-character weights: ASCII counts a third of a token,
/// CJK ideographs, kana and hangul a full token, emoji and pictographs two
/// tokens, anything else half a token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().map(char_units).sum::<usize>().div_ceil(UNITS_PER_TOKEN)
}

fn char_units(c: char) -> usize {
    if c.is_ascii() {
        return 2;
    }
    match c as u32 {
        // Hangul Jamo, CJK radicals through Yi, Hangul syllables,
        // compatibility ideographs, fullwidth forms, CJK extension planes.
        0x1100..=0x11FF
        | 0x2E80..=0xA4CF
        | 0xAC00..=0xD7AF
        | 0xF900..=0xFAFF
        | 0xFF00..=0xFFEF
        | 0x20000..=0x3FFFF => 6,
        // Misc symbols, dingbats, emoji and pictograph blocks.
        0x2600..=0x27BF | 0x1F000..=0x1FAFF => 12,
        _ => 3,
    }
}

/// Longest prefix of `text` within `max_tokens`.
fn keep_head(text: &str, max_tokens: usize) -> String {
    let limit = max_tokens * UNITS_PER_TOKEN;
    let mut used = 0;
    text.chars()
        .take_while(|&c| {
            used += char_units(c);
            used <= limit
        })
        .collect()
}

/// Longest suffix of `text` within `max_tokens`.
fn keep_tail(text: &str, max_tokens: usize) -> String {
    let limit = max_tokens * UNITS_PER_TOKEN;
    let mut used = 0;
    let mut kept: Vec<char> = text
        .chars()
        .rev()
        .take_while(|&c| {
            used += char_units(c);
            used <= limit
        })
        .collect();
    kept.reverse();
    kept.into_iter().collect()
}

/// Context budget configuration.
#[derive(Debug, Clone)]
pub struct ContextBudgetConfig {
    /// Model context window in tokens. Default: 128k.
    pub total_limit: usize,
    /// Tokens kept free for the model's reply. Default: 4096.
    pub reserved_for_response: usize,
    /// Tokens kept free for tool definitions. Default: 2000.
    pub reserved_for_tools: usize,
    /// Token cap skills are cut to when trimming. Default: 4000.
    pub skills_cap_tokens: usize,
}

impl Default for ContextBudgetConfig {
    fn default() -> Self {
        Self {
            total_limit: DEFAULT_TOTAL_LIMIT,
            reserved_for_response: 4_096,
            reserved_for_tools: 2_000,
            skills_cap_tokens: 4_000,
        }
    }
}

impl ContextBudgetConfig {
    pub fn with_total_limit(mut self, tokens: usize) -> Self {
        self.total_limit = tokens;
        self
    }

    pub fn with_reserved_for_response(mut self, tokens: usize) -> Self {
        self.reserved_for_response = tokens;
        self
    }

    pub fn with_reserved_for_tools(mut self, tokens: usize) -> Self {
        self.reserved_for_tools = tokens;
        self
    }

    pub fn with_skills_cap(mut self, tokens: usize) -> Self {
        self.skills_cap_tokens = tokens;
        self
    }

    /// Tokens left for the prompt after reserves.
    pub fn available(&self) -> usize {
        self.total_limit
            .saturating_sub(self.reserved_for_response)
            .saturating_sub(self.reserved_for_tools)
    }
}

/// Token estimate per prompt part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SectionTokens {
    pub system: usize,
    pub skills: usize,
    pub history: usize,
    pub message: usize,
}

impl SectionTokens {
    fn measure(system: &str, skills: &str, history: &str, message: &str) -> Self {
        Self {
            system: estimate_tokens(system),
            skills: estimate_tokens(skills),
            history: estimate_tokens(history),
            message: estimate_tokens(message),
        }
    }

    pub fn total(&self) -> usize {
        self.system + self.skills + self.history + self.message
    }
}

/// What [`ContextBudgetManager::check_and_trim`] found and did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetReport {
    /// Tokens available after reserves.
    pub available: usize,
    pub before: SectionTokens,
    pub after: SectionTokens,
    pub trimmed: bool,
    /// One note per trimming step; `None` when nothing was trimmed.
    pub warning: Option<String>,
}

impl BudgetReport {
    pub fn tokens_before(&self) -> usize {
        self.before.total()
    }

    pub fn tokens_after(&self) -> usize {
        self.after.total()
    }

    pub fn within_budget(&self) -> bool {
        self.tokens_after() <= self.available
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        let mut s = format!(
            "context: ~{} tokens of {} available",
            self.tokens_after(),
            self.available
        );
        if self.trimmed {
            s.push_str(&format!(" (trimmed from ~{})", self.tokens_before()));
        }
        s
    }
}

/// The four prompt parts after budgeting, plus the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrimmedContext {
    pub report: BudgetReport,
    pub system: String,
    pub skills: String,
    pub history: String,
    /// The user's message, unchanged.
    pub message: String,
}

/// Bounds the text assembled for one conversational turn.
///
/// # Example
///
/// ```ignore
/// let manager = ContextBudgetManager::new(ContextBudgetConfig::default());
/// let ctx = manager.check_and_trim(&system, &skills, &history, &message);
/// if let Some(ref warning) = ctx.report.warning {
///     tracing::warn!("{warning}");
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContextBudgetManager {
    config: ContextBudgetConfig,
}

impl ContextBudgetManager {
    pub fn new(config: ContextBudgetConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextBudgetConfig {
        &self.config
    }

    pub fn check_and_trim(
        &self,
        system: &str,
        skills: &str,
        history: &str,
        message: &str,
    ) -> TrimmedContext {
        let available = self.config.available();
        let before = SectionTokens::measure(system, skills, history, message);
        let mut ctx = TrimmedContext {
            report: BudgetReport {
                available,
                before,
                after: before,
                trimmed: false,
                warning: None,
            },
            system: system.to_string(),
            skills: skills.to_string(),
            history: history.to_string(),
            message: message.to_string(),
        };
        if before.total() <= available {
            return ctx;
        }

        let mut notes = Vec::new();
        let mut tokens = before;

        // 1. Skills down to the cap.
        let cap = self.config.skills_cap_tokens;
        if tokens.skills > cap {
            let marker = estimate_tokens(SKILLS_MARKER);
            ctx.skills = if cap > marker {
                format!("{}{SKILLS_MARKER}", keep_head(skills, cap - marker))
            } else {
                // No room for the marker without exceeding the cap.
                keep_head(skills, cap)
            };
            let now = estimate_tokens(&ctx.skills);
            notes.push(format!("skills truncated from ~{} to ~{now} tokens", tokens.skills));
            tokens.skills = now;
        }

        // 2. History, newest first.
        if tokens.total() > available && tokens.history > 0 {
            let room = available.saturating_sub(tokens.system + tokens.skills + tokens.message);
            ctx.history = trim_history(history, room);
            let now = estimate_tokens(&ctx.history);
            notes.push(format!(
                "history trimmed to newest ~{now} of ~{} tokens",
                tokens.history
            ));
            tokens.history = now;
        }

        // 3. System prompt, head and tail.
        if tokens.total() > available && tokens.system > 0 {
            let room = available.saturating_sub(tokens.skills + tokens.history + tokens.message);
            ctx.system = trim_middle(system, room);
            let now = estimate_tokens(&ctx.system);
            notes.push(format!(
                "system prompt trimmed from ~{} to ~{now} tokens",
                tokens.system
            ));
            tokens.system = now;
        }

        if tokens.total() > available {
            notes.push(format!(
                "still ~{} tokens over budget; the message alone needs ~{}",
                tokens.total() - available,
                tokens.message
            ));
        }

        let warning = notes.join("; ");
        warn!("Context over budget: {warning}");
        ctx.report.after = tokens;
        ctx.report.trimmed = true;
        ctx.report.warning = Some(warning);
        debug!("{}", ctx.report.to_log_string());
        ctx
    }
}

/// Keep the newest suffix of `history` within `room` tokens, starting at a
/// line boundary when one is available.
fn trim_history(history: &str, room: usize) -> String {
    let marker = estimate_tokens(HISTORY_MARKER);
    if room <= marker {
        return String::new();
    }
    let tail = keep_tail(history, room - marker);
    let tail = match tail.split_once('\n') {
        Some((partial, rest)) if !rest.is_empty() && !partial.is_empty() => rest.to_string(),
        _ => tail,
    };
    if tail.is_empty() {
        return tail;
    }
    format!("{HISTORY_MARKER}{tail}")
}

/// Keep head and tail of `system` within `room` tokens.
fn trim_middle(system: &str, room: usize) -> String {
    let body = room.saturating_sub(estimate_tokens(SYSTEM_MARKER));
    if body == 0 {
        return String::new();
    }
    let head = keep_head(system, body / 2);
    let tail = keep_tail(system, body - body / 2);
    format!("{head}{SYSTEM_MARKER}{tail}")
}
