//! Turn a chat-completion conversation into platform-sized text blocks.
//!
//! Each message renders as `"{label}: {content}\n\n"`. Consecutive messages
//! share a block while it stays under `max_chunk_len` characters; a single
//! message that is too long on its own is cut in two and the tail is
//! re-queued as an unlabeled message right after the head.

use std::collections::HashMap;

use slackline_common::{MessageContent, PromptMessage};
use slackline_config::BridgeConfig;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub role_names: HashMap<String, String>,
    pub omit_first_role_label: bool,
    pub max_chunk_len: usize,
    pub min_split_size: usize,
}

impl From<&BridgeConfig> for ChunkerConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            role_names: config.role_names.clone(),
            omit_first_role_label: config.omit_first_role_label,
            max_chunk_len: config.max_chunk_len,
            min_split_size: config.min_split_size,
        }
    }
}

/// Build the ordered prompt blocks. The result is never empty.
pub fn build_prompt_chunks(messages: &[PromptMessage], config: &ChunkerConfig) -> Vec<String> {
    let max = config.max_chunk_len;
    let mut queue: Vec<PromptMessage> = messages.to_vec();
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    let mut idx = 0;
    while idx < queue.len() {
        let mut part = render_message(&queue[idx], idx, config);
        let mut part_len = part.chars().count();

        if current_len + part_len < max {
            current.push_str(&part);
            current_len += part_len;
            idx += 1;
            continue;
        }

        if current_len > 0 {
            chunks.push(std::mem::take(&mut current));
        }

        if part_len > max {
            let content = queue[idx].content.to_text();
            // Room left once this message's own label and separator are in.
            let label_len = render_message(&with_content(&queue[idx], ""), idx, config)
                .chars()
                .count();
            let (head, tail) = split_in_two(
                &content,
                max.saturating_sub(label_len).max(1),
                config.min_split_size,
            );
            let head_message = with_content(&queue[idx], head);
            part = render_message(&head_message, idx, config);
            part_len = part.chars().count();
            queue.insert(idx + 1, PromptMessage::text("", tail));
        }

        current = part;
        current_len = part_len;
        idx += 1;
    }

    chunks.push(current);
    chunks
}

fn with_content(message: &PromptMessage, content: &str) -> PromptMessage {
    PromptMessage {
        content: MessageContent::Text(content.to_string()),
        ..message.clone()
    }
}

fn render_message(message: &PromptMessage, idx: usize, config: &ChunkerConfig) -> String {
    let content = message.content.to_text();
    let is_lead = message.role == "system" || message.role == "user";
    if config.omit_first_role_label && idx == 0 && is_lead {
        return format!("{content}\n\n");
    }

    let label = if message.role == "system" && message.name.is_some() {
        // Example dialogue: the speaker is carried in `name`.
        message
            .name
            .as_deref()
            .and_then(|name| config.role_names.get(name))
    } else {
        config.role_names.get(&message.role)
    };

    match label {
        Some(label) if !label.is_empty() => format!("{label}: {content}\n\n"),
        _ => format!("{content}\n\n"),
    }
}

/// Split `text` so the head holds at most `max_chars` characters.
///
/// Prefers the last newline, then the last sentence end, then the last
/// whitespace found at or after `min_split` characters; otherwise cuts hard
/// at `max_chars`. `head + tail == text` always holds.
pub fn split_in_two(text: &str, max_chars: usize, min_split: usize) -> (&str, &str) {
    let Some((limit, _)) = text.char_indices().nth(max_chars) else {
        return (text, "");
    };
    let window = &text[..limit];
    let floor = text
        .char_indices()
        .nth(min_split.min(max_chars))
        .map_or(limit, |(i, _)| i);

    let cut = window
        .rfind('\n')
        .map(|i| i + 1)
        .filter(|&i| i >= floor)
        .or_else(|| last_sentence_end(window).filter(|&i| i >= floor))
        .or_else(|| {
            window
                .char_indices()
                .rev()
                .find(|(_, c)| c.is_whitespace())
                .map(|(i, c)| i + c.len_utf8())
                .filter(|&i| i >= floor)
        })
        .unwrap_or(limit);

    text.split_at(cut)
}

fn last_sentence_end(window: &str) -> Option<usize> {
    [". ", "! ", "? ", ".\t", "!\t", "?\t"]
        .iter()
        .filter_map(|end| window.rfind(end).map(|i| i + end.len()))
        .max()
}
