//! Slack mrkdwn format converter.
//!
//! Agent replies are written in standard Markdown; Slack renders its own
//! "mrkdwn" dialect:
//!
//! - Uses `*bold*` instead of `**bold**`
//! - Uses `_italic_` instead of `*italic*`
//! - Uses `~strikethrough~` instead of `~~strikethrough~~`
//! - Code blocks use triple backticks (same as standard)
//! - Links use `<url|text>` format

use regex::Regex;
use std::sync::LazyLock;

/// Maximum length for a single posted text field.
pub const MAX_BLOCK_TEXT_LENGTH: usize = 3000;

static H1_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^# (.+)$").unwrap());
static H2_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^## (.+)$").unwrap());
static H3_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^###+ (.+)$").unwrap());
static BOLD_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());
static STRIKETHROUGH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"~~(.+?)~~").unwrap());
static LINK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap());
static DASH_LIST_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\s*)[-*] (.*)$").unwrap());
static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^```(\w*)$").unwrap());
static USER_MENTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<@([A-Z0-9]+)(\|[^>]*)?>").unwrap());

/// Convert standard Markdown to Slack mrkdwn format.
///
/// | Input                | Output              |
/// |----------------------|---------------------|
/// | `# Title`            | `*Title*`           |
/// | `### Section`        | `_Section_`         |
/// | `**bold**`           | `*bold*`            |
/// | `*italic*`           | `_italic_`          |
/// | `~~strike~~`         | `~strike~`          |
/// | `[text](url)`        | `<url|text>`        |
/// | `- item`             | `• item`            |
/// | Code blocks          | Preserved           |
pub fn convert_to_slack_mrkdwn(input: &str) -> String {
    let mut in_code_block = false;
    let mut out: Vec<String> = Vec::new();

    for line in input.lines() {
        if CODE_FENCE.is_match(line) {
            in_code_block = !in_code_block;
            out.push(line.to_string());
            continue;
        }
        if in_code_block {
            out.push(line.to_string());
            continue;
        }
        out.push(convert_inline_formatting(&convert_line(line)));
    }

    out.join("\n")
}

fn convert_line(line: &str) -> String {
    if let Some(caps) = H1_PATTERN.captures(line).or_else(|| H2_PATTERN.captures(line)) {
        return format!("**{}**", &caps[1]);
    }

    if let Some(caps) = H3_PATTERN.captures(line) {
        return format!("_{}_", &caps[1]);
    }

    if let Some(caps) = DASH_LIST_PATTERN.captures(line) {
        return format!("{}• {}", &caps[1], &caps[2]);
    }

    line.to_string()
}

fn convert_inline_formatting(text: &str) -> String {
    // Italic first so that the single asterisks produced by bold conversion
    // are left alone.
    let result = convert_italic(text);
    let result = BOLD_PATTERN.replace_all(&result, "*$1*");
    let result = STRIKETHROUGH_PATTERN.replace_all(&result, "~$1~");
    LINK_PATTERN.replace_all(&result, "<$2|$1>").into_owned()
}

/// Rewrite standalone `*text*` spans (not part of `**`) to `_text_`.
fn convert_italic(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut result = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        let opens_italic = chars[i] == '*'
            && chars.get(i + 1).is_some_and(|c| *c != '*' && *c != ' ')
            && (i == 0 || chars[i - 1] != '*');

        if opens_italic {
            if let Some(end) = (i + 1..chars.len()).find(|&j| chars[j] == '*') {
                let closes = chars[end - 1] != ' ' && chars.get(end + 1) != Some(&'*');
                if closes {
                    result.push('_');
                    result.extend(&chars[i + 1..end]);
                    result.push('_');
                    i = end + 1;
                    continue;
                }
            }
        }

        result.push(chars[i]);
        i += 1;
    }

    result
}

/// Split a message into chunks that fit Slack's text limit, preferring line
/// and word boundaries.
pub fn split_message(text: &str) -> Vec<String> {
    if text.len() <= MAX_BLOCK_TEXT_LENGTH {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let sep = if current.is_empty() { 0 } else { 1 };
        if current.len() + sep + line.len() <= MAX_BLOCK_TEXT_LENGTH {
            if sep == 1 {
                current.push('\n');
            }
            current.push_str(line);
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        let mut remaining = line;
        while remaining.len() > MAX_BLOCK_TEXT_LENGTH {
            let split = find_split_point(remaining, MAX_BLOCK_TEXT_LENGTH);
            chunks.push(remaining[..split].to_string());
            remaining = &remaining[split..];
        }
        current = remaining.to_string();
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Find a split point at or below `max_len` on a char boundary, preferring
/// the byte after the last space.
fn find_split_point(text: &str, max_len: usize) -> usize {
    let mut limit = max_len.min(text.len());
    while !text.is_char_boundary(limit) {
        limit -= 1;
    }

    match text[..limit].rfind(' ') {
        Some(pos) if pos > 0 => pos + 1,
        _ => limit,
    }
}

/// Whether `text` contains a mention of `user_id`.
pub fn mentions_user(text: &str, user_id: &str) -> bool {
    USER_MENTION
        .captures_iter(text)
        .any(|caps| &caps[1] == user_id)
}

/// Remove mentions of `user_id` and trim the result.
pub fn strip_mention(text: &str, user_id: &str) -> String {
    USER_MENTION
        .replace_all(text, |caps: &regex::Captures<'_>| {
            if &caps[1] == user_id {
                String::new()
            } else {
                caps[0].to_string()
            }
        })
        .trim()
        .to_string()
}
