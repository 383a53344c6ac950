//! Compact conversation recap, shown in the fresh terminal after a reload
//! so the user lands with context instead of a blank prompt.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;

use crate::record::{block_text, block_type, Record, RecordKind};

const MAX_RECENT_TOPICS: usize = 8;
const MAX_THEMES: usize = 5;
const TOPIC_WIDTH: usize = 70;

static TAG_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<system-reminder>.*?</system-reminder>|<local-command-caveat>.*?</local-command-caveat>|<command-name>.*?</command-name>|<command-message>.*?</command-message>|<command-args>.*?</command-args>|<local-command-stdout>.*?</local-command-stdout>",
    )
    .unwrap()
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+/?>").unwrap());
static MARKUP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[#*`]{1,6}").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z][a-z_-]{2,}").unwrap());

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    "the and for with that this from into what when where which would could should \
     have has had been being will just like make sure need want about then than \
     them they their there here your you our are was were not can don didn does \
     let see get got run set start change add read write open close update use \
     file files code also well back still way new one two first last next please \
     fix check look find tell work think know say said try keep show"
        .split_whitespace()
        .collect()
});

fn clean_user_text(text: &str) -> String {
    let text = TAG_BLOCK_RE.replace_all(text, "");
    let text = TAG_RE.replace_all(&text, "");
    let text = MARKUP_RE.replace_all(&text, "");
    SPACE_RE.replace_all(&text, " ").trim().to_string()
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let cut: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{cut}...")
}

fn record_text(record: &Record) -> String {
    record
        .content_blocks()
        .iter()
        .filter(|b| block_type(b) == "text")
        .map(block_text)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Greedy keyword cover over the topic list: each theme claims the topics
/// no higher-ranked theme already covered, so counts reflect unique
/// coverage.
fn extract_themes(topics: &[String]) -> Vec<(String, usize)> {
    let mut word_topics: Vec<(String, HashSet<usize>)> = Vec::new();
    for (i, topic) in topics.iter().enumerate() {
        let lowered = topic.to_lowercase();
        let words: HashSet<&str> = WORD_RE
            .find_iter(&lowered)
            .map(|m| m.as_str())
            .filter(|w| !STOP_WORDS.contains(w))
            .collect();
        for word in words {
            match word_topics.iter_mut().find(|(w, _)| w == word) {
                Some((_, ids)) => {
                    ids.insert(i);
                }
                None => {
                    word_topics.push((word.to_string(), HashSet::from([i])));
                }
            }
        }
    }
    word_topics.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));

    let mut covered: HashSet<usize> = HashSet::new();
    let mut themes = Vec::new();
    for (word, ids) in word_topics {
        let fresh = ids.difference(&covered).count();
        if fresh >= 2 {
            themes.push((word, ids.len()));
            covered.extend(ids);
            if themes.len() >= MAX_THEMES {
                break;
            }
        }
    }
    themes
}

/// Build the recap text: exchange counts, theme clusters, recent topics,
/// and the last assistant line.
pub fn generate_recap(records: &[Record]) -> String {
    let mut user_turns: Vec<String> = Vec::new();
    let mut last_assistant = String::new();

    for record in records {
        match record.kind() {
            RecordKind::User => {
                let text = clean_user_text(&record_text(record));
                if text.len() >= 3 {
                    user_turns.push(text);
                }
            }
            RecordKind::Assistant => {
                let text = SPACE_RE.replace_all(&record_text(record), " ").trim().to_string();
                if text.len() >= 3 {
                    last_assistant = text;
                }
            }
            _ => {}
        }
    }

    if user_turns.is_empty() {
        return String::new();
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut topics: Vec<String> = Vec::new();
    for turn in &user_turns {
        let key: String = turn.chars().take(40).collect::<String>().to_lowercase();
        if seen.insert(key) {
            topics.push(turn.clone());
        }
    }

    let mut lines = vec![
        String::new(),
        "  PREVIOUSLY ON THIS SESSION".to_string(),
        format!("  {} exchanges | {} topics", user_turns.len(), topics.len()),
        String::new(),
    ];

    if topics.len() >= 6 {
        let themes = extract_themes(&topics);
        if !themes.is_empty() {
            let rendered: Vec<String> =
                themes.iter().map(|(word, count)| format!("{word} ({count})")).collect();
            lines.push(format!("  Themes: {}", rendered.join(", ")));
            lines.push(String::new());
        }
    }

    lines.push("  Recent:".to_string());
    let recent: Vec<&String> = topics.iter().rev().take(MAX_RECENT_TOPICS).collect();
    for topic in &recent {
        lines.push(format!("  - {}", truncate(topic, TOPIC_WIDTH)));
    }
    if topics.len() > MAX_RECENT_TOPICS {
        lines.push(format!("  ... +{} earlier", topics.len() - MAX_RECENT_TOPICS));
    }

    if !last_assistant.is_empty() {
        lines.push(String::new());
        lines.push(format!("  Last: {}", truncate(&last_assistant, 72)));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Generate and write the recap next to the other temp artifacts.
pub fn save_recap(records: &[Record], dest: &Path) -> Result<()> {
    crate::session::write_atomically(dest, &generate_recap(records))
}
