use chrono::{DateTime, Utc};
use scraper::Html;
use sha2::{Digest, Sha256};

/// Strip an HTML document down to its visible text, dropping script/style
/// and collapsing runs of whitespace.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();
    for node in document.root_element().descendants() {
        if let Some(text) = node.value().as_text() {
            let skipped = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .map_or(false, |e| matches!(e.name(), "script" | "style" | "head"))
            });
            if !skipped {
                out.push_str(text);
                out.push(' ');
            }
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Word-boundary excerpt of at most `max_len` characters.
pub fn extract_excerpt(text: &str, max_len: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_len {
        return trimmed.to_string();
    }
    let truncated: String = trimmed.chars().take(max_len).collect();
    let cut = truncated.rfind(' ').unwrap_or(truncated.len());
    format!("{}...", truncated[..cut].trim_end())
}

/// Deterministic fingerprint over an item's significant fields.
///
/// Unchanged content must re-hash to the same value across process restarts,
/// so the hash covers only stable inputs (no wall-clock, no randomness).
/// `serde_json` serializes object keys in sorted order, which keeps the
/// metadata component canonical.
pub fn sync_hash(
    title: &str,
    content: &str,
    external_updated_at: Option<&DateTime<Utc>>,
    metadata: &serde_json::Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0x1f]);
    hasher.update(content.as_bytes());
    hasher.update([0x1f]);
    if let Some(ts) = external_updated_at {
        hasher.update(ts.to_rfc3339().as_bytes());
    }
    hasher.update([0x1f]);
    hasher.update(metadata.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn html_to_text_strips_markup_and_scripts() {
        let html = r#"
            <html><head><title>ignored</title><style>p { color: red; }</style></head>
            <body><h1>Waste collection</h1>
            <p>Bins are emptied <b>weekly</b>.</p>
            <script>alert("nope");</script></body></html>
        "#;
        let text = html_to_text(html);
        assert_eq!(text, "Waste collection Bins are emptied weekly .");
    }

    #[test]
    fn excerpt_respects_word_boundaries() {
        let text = "The town hall is open Monday through Friday from nine to five";
        let excerpt = extract_excerpt(text, 30);
        assert!(excerpt.len() <= 34);
        assert!(excerpt.ends_with("..."));
        assert!(!excerpt.contains("Frida..."));
    }

    #[test]
    fn excerpt_short_text_is_unchanged() {
        assert_eq!(extract_excerpt("  short  ", 100), "short");
    }

    #[test]
    fn sync_hash_is_deterministic() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let meta = serde_json::json!({"space": "HR", "version": 3});
        let a = sync_hash("Title", "Body", Some(&ts), &meta);
        let b = sync_hash("Title", "Body", Some(&ts), &meta);
        assert_eq!(a, b);
    }

    #[test]
    fn sync_hash_changes_with_content() {
        let meta = serde_json::json!({});
        let a = sync_hash("Title", "Body", None, &meta);
        let b = sync_hash("Title", "Body changed", None, &meta);
        assert_ne!(a, b);
    }

    #[test]
    fn sync_hash_field_separators_prevent_ambiguity() {
        let meta = serde_json::json!({});
        let a = sync_hash("ab", "c", None, &meta);
        let b = sync_hash("a", "bc", None, &meta);
        assert_ne!(a, b);
    }
}
