//! Prompt templates. Placeholders are `{name}` and are filled by [`render`].

pub const CATEGORIES: &[&str] = &[
    "Meeting Announcement",
    "Meeting Materials",
    "New Announcement",
    "Press Release",
    "Recent Update",
    "Timeless Info",
    "New Document",
    "Outdated Content",
];

pub const CLASSIFY_PROMPT: &str = r#"You are an automated content classifier for updates to a state government website.
Today's date is {run_date}.

Decide whether the page below is genuinely new (a new announcement, release, document or meeting notice),
possibly new (no date to judge by), or not new (a routine edit to old or timeless content).
Check the dates mentioned in the content: if everything it describes is more than two months old, it is stale.

URL: {url}
FILE TYPE: {filetype}
CONTENT:
{content}

Respond with a single, valid JSON object and nothing else:
{
  "is_new": "new" | "maybe" | "not_new",
  "category": "one of: {categories}",
  "summary": "a concise, neutral summary of the content in 1-2 sentences, suitable for a news lead",
  "is_stale": true | false
}
"#;

pub const MEETING_PROMPT: &str = r#"Today's date is {run_date}. The text below announces a public meeting.
Extract the meeting details.

URL: {url}
CONTENT:
{content}

Respond with a single, valid JSON object and nothing else:
{
  "title": "name of the body or meeting",
  "date": "YYYY-MM-DD or null",
  "time": "start time as written, or null",
  "location": "place or 'virtual', or null",
  "summary": "one sentence on what will be discussed"
}
"#;

pub const RANK_PROMPT: &str = r#"You are a senior news editor preparing a daily briefing of state government updates.
Pick the {top_n} items most important to a general reader and order them, most important first.

NEWS ITEMS:
{stories}

MEETINGS:
{meetings}

Respond with a single, valid JSON object and nothing else:
{ "top_stories": ["url of the most important item", "..."] }
Only use urls that appear above.
"#;

/// Fill `{key}` placeholders in one pass, so substituted text is never expanded again.
/// Unknown placeholders and literal braces are left as they are.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let found = after.find('}').and_then(|end| {
            let key = &after[..end];
            values
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v, end))
        });
        match found {
            Some((value, end)) => {
                out.push_str(value);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Canonical spelling of a category, or `None` when the backend made one up.
pub fn canonical_category(raw: &str) -> Option<&'static str> {
    let wanted = raw.trim().to_lowercase();
    CATEGORIES
        .iter()
        .copied()
        .find(|c| c.to_lowercase() == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_placeholders_once_each() {
        let categories = CATEGORIES.join(", ");
        let out = render(
            CLASSIFY_PROMPT,
            &[
                ("run_date", "2025-10-10"),
                ("url", "https://a"),
                ("filetype", "html"),
                ("content", "body with {categories} inside"),
                ("categories", categories.as_str()),
            ],
        );
        assert!(out.contains("Today's date is 2025-10-10."));
        assert!(out.contains("URL: https://a"));
        assert!(out.contains("body with {categories} inside"));
        assert!(!out.contains("{run_date}"));
    }

    #[test]
    fn categories_are_matched_case_insensitively() {
        assert_eq!(canonical_category("press release"), Some("Press Release"));
        assert_eq!(canonical_category("Gossip"), None);
    }
}
