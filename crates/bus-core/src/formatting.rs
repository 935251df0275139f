//! Text-shaping helpers shared by the dispatcher's output post-processing and
//! the channel adapter's display layer. Discord renders Markdown natively, so
//! unlike the bot this is descended from, there is no Markdown→HTML
//! conversion step here — only truncation, chunking and tool-status text.

const RESPONSE_TRUNCATE_MARKER: &str = "\n\n[Response truncated...]";
const SEND_FILE_TAG_RE_SRC: &str = r"\[send_file:\s*([^\]]+)\]";

/// Truncate `text` to at most `limit` characters, appending the marker when
/// truncation actually occurs. A no-op when `text.len() <= limit`.
pub fn truncate_response(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let marker_len = RESPONSE_TRUNCATE_MARKER.chars().count();
    let budget = limit.saturating_sub(marker_len);
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}{RESPONSE_TRUNCATE_MARKER}")
}

/// Split `text` into chunks of at most `limit` characters each, preferring to
/// break on a newline, then a space, then a hard cut. `chunks.concat()` (with
/// no separators re-inserted) reconstructs the input exactly.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= limit {
            chunks.push(chars[start..].iter().collect());
            break;
        }

        let window = &chars[start..start + limit];
        let break_at = window
            .iter()
            .rposition(|c| *c == '\n')
            .or_else(|| window.iter().rposition(|c| *c == ' '))
            .map(|i| i + 1)
            .unwrap_or(limit);

        let cut = if break_at == 0 { limit } else { break_at };
        chunks.push(chars[start..start + cut].iter().collect());
        start += cut;
    }

    chunks
}

/// Strip every `[send_file: <path>]` tag from `text`, returning the cleaned
/// text and the ordered, de-duplicated set of referenced paths.
pub fn extract_send_file_tags(text: &str) -> (String, Vec<String>) {
    let re = regex::Regex::new(SEND_FILE_TAG_RE_SRC).expect("valid regex");
    let mut files = Vec::new();
    for cap in re.captures_iter(text) {
        let path = cap[1].trim().to_string();
        if !files.contains(&path) {
            files.push(path);
        }
    }
    let cleaned = re.replace_all(text, "").to_string();
    (cleaned.trim().to_string(), files)
}

fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() >= 2 {
        return format!("{}/{}", parts[parts.len() - 2], parts[parts.len() - 1]);
    }
    parts.last().copied().unwrap_or("file").to_string()
}

fn truncate_one_line(text: &str, max_len: usize) -> String {
    let cleaned = text.replace('\n', " ").trim().to_string();
    if cleaned.chars().count() <= max_len {
        return cleaned;
    }
    format!("{}...", cleaned.chars().take(max_len).collect::<String>())
}

fn code(text: &str) -> String {
    format!("`{text}`")
}

/// Plain-text (Discord Markdown) summary of a tool use, for streaming status
/// display and as the human-readable `toolInputSummary` in approval requests.
pub fn format_tool_status(tool_name: &str, tool_input: &serde_json::Value) -> String {
    let emoji_map = [
        ("Read", "📖"),
        ("Write", "📝"),
        ("Edit", "✏️"),
        ("Bash", "▶️"),
        ("Glob", "🔍"),
        ("Grep", "🔎"),
        ("WebSearch", "🔍"),
        ("WebFetch", "🌐"),
        ("Task", "🎯"),
        ("TodoWrite", "📋"),
        ("mcp__", "🔧"),
    ];

    let mut emoji = "🔧";
    for (k, v) in emoji_map {
        if tool_name.contains(k) {
            emoji = v;
            break;
        }
    }

    let get = |k: &str| tool_input.get(k).and_then(|v| v.as_str()).unwrap_or("");

    if tool_name == "Read" {
        let file_path = get("file_path");
        let lower = file_path.to_lowercase();
        let image_exts = [
            ".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".svg", ".ico",
        ];
        if image_exts.iter().any(|ext| lower.ends_with(ext)) {
            return "👀 Viewing".to_string();
        }
        return format!("{emoji} Reading {}", code(&shorten_path(file_path)));
    }

    if tool_name == "Write" {
        let file_path = get("file_path");
        return format!("{emoji} Writing {}", code(&shorten_path(file_path)));
    }

    if tool_name == "Edit" {
        let file_path = get("file_path");
        return format!("{emoji} Editing {}", code(&shorten_path(file_path)));
    }

    if tool_name == "Bash" {
        let cmd = get("command");
        let desc = get("description");
        if !desc.is_empty() {
            return format!("{emoji} {desc}");
        }
        return format!("{emoji} {}", code(&truncate_one_line(cmd, 50)));
    }

    if tool_name == "Grep" {
        let pattern = get("pattern");
        let path = get("path");
        if !path.is_empty() {
            return format!(
                "{emoji} Searching {} in {}",
                code(&truncate_one_line(pattern, 30)),
                code(&shorten_path(path))
            );
        }
        return format!(
            "{emoji} Searching {}",
            code(&truncate_one_line(pattern, 40))
        );
    }

    if tool_name == "Glob" {
        let pattern = get("pattern");
        return format!("{emoji} Finding {}", code(&truncate_one_line(pattern, 50)));
    }

    if tool_name == "WebSearch" {
        let query = get("query");
        return format!("{emoji} Searching: {}", truncate_one_line(query, 50));
    }

    if tool_name == "WebFetch" {
        let url = get("url");
        return format!("{emoji} Fetching {}", code(&truncate_one_line(url, 50)));
    }

    if tool_name == "Task" {
        let desc = get("description");
        if !desc.is_empty() {
            return format!("{emoji} Agent: {desc}");
        }
    }

    format!("{emoji} {tool_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_status_read_image() {
        let v = serde_json::json!({"file_path":"/tmp/a.png"});
        assert_eq!(format_tool_status("Read", &v), "👀 Viewing");
    }

    #[test]
    fn truncate_response_is_noop_under_limit() {
        assert_eq!(truncate_response("hello", 4000), "hello");
    }

    #[test]
    fn truncate_response_marks_over_limit() {
        let long = "a".repeat(4100);
        let out = truncate_response(&long, 4000);
        assert!(out.chars().count() <= 4000);
        assert!(out.ends_with("[Response truncated...]"));
    }

    #[test]
    fn chunk_text_respects_limit_and_reconstructs() {
        let text = "a".repeat(2500);
        let chunks = chunk_text(&text, 2000);
        assert!(chunks.iter().all(|c| c.chars().count() <= 2000));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunk_text_prefers_newline_break() {
        let mut text = "x".repeat(10);
        text.push('\n');
        text.push_str(&"y".repeat(10));
        let chunks = chunk_text(&text, 15);
        assert_eq!(chunks[0], "x".repeat(10) + "\n");
    }

    #[test]
    fn extract_send_file_tags_strips_and_dedupes() {
        let text = "done [send_file: /tmp/a.txt] more [send_file: /tmp/a.txt] end";
        let (cleaned, files) = extract_send_file_tags(text);
        assert_eq!(files, vec!["/tmp/a.txt".to_string()]);
        assert!(!cleaned.contains("send_file"));
    }
}
