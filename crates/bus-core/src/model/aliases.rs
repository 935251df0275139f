/// Resolve a short model alias to the fully-qualified model id the CLI
/// expects. Unknown strings pass through unchanged, so new models work
/// without a code change before an alias is added for them.
pub fn resolve_model_alias(alias: &str) -> String {
    match alias {
        "sonnet" => "claude-sonnet-4-5-20250929",
        "opus" => "claude-opus-4-1-20250805",
        "haiku" => "claude-haiku-4-5-20251001",
        "gpt-5.3-codex" => "gpt-5.3-codex",
        other => return other.to_string(),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_aliases() {
        assert_eq!(resolve_model_alias("sonnet"), "claude-sonnet-4-5-20250929");
    }

    #[test]
    fn passes_through_unknown_strings() {
        assert_eq!(resolve_model_alias("claude-future-9000"), "claude-future-9000");
    }
}
