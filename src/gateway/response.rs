/// Remove an enclosing Markdown code fence (```` ```json ````, ```` ```html ````
/// or bare ```` ``` ````) and surrounding whitespace. Text without a fence
/// comes back trimmed.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    let body = match rest.split_once('\n') {
        Some((label, body)) if label.trim().chars().all(|c| c.is_ascii_alphanumeric()) => body,
        _ => ["json", "html"]
            .iter()
            .find_map(|label| rest.strip_prefix(label))
            .unwrap_or(rest),
    };

    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
