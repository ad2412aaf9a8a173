use chrono::NaiveDate;
use serde_json::Value;
use std::sync::Arc;

use super::prompts::{self, CATEGORIES};
use super::{
    extract_json_from_text, Classification, ClassifyRequest, LlmProvider, LlmRequest, Meeting,
    MeetingParser, ModelBackend, StoryCandidate,
};
use crate::error::ProviderError;
use crate::exclusion::OUTDATED_CATEGORY;
use crate::record::Newness;

/// Prompt-driven backend: renders a template, sends it through a transport and parses
/// the JSON answer. The flash model classifies and parses meetings; the pro model ranks.
pub struct PromptBackend {
    provider: Arc<dyn LlmProvider>,
    flash_model: String,
    pro_model: String,
    temperature: f32,
}

impl PromptBackend {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        flash_model: impl Into<String>,
        pro_model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            flash_model: flash_model.into(),
            pro_model: pro_model.into(),
            temperature: 0.2,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    async fn ask(&self, model: &str, prompt: String, max_tokens: usize) -> Result<String, ProviderError> {
        let response = self
            .provider
            .generate(LlmRequest {
                prompt,
                model: model.to_string(),
                max_tokens: Some(max_tokens),
                temperature: Some(self.temperature),
                json: true,
            })
            .await?;
        Ok(response.content)
    }
}

#[async_trait::async_trait]
impl ModelBackend for PromptBackend {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Classification, ProviderError> {
        let run_date = request.run_date.format("%Y-%m-%d").to_string();
        let categories = CATEGORIES.join(", ");
        let prompt = prompts::render(
            prompts::CLASSIFY_PROMPT,
            &[
                ("run_date", run_date.as_str()),
                ("url", request.url.as_str()),
                ("filetype", request.filetype.as_str()),
                ("categories", categories.as_str()),
                ("content", request.content.as_str()),
            ],
        );
        let answer = self.ask(&self.flash_model, prompt, 512).await?;
        parse_classification(&answer)
    }

    async fn rank(
        &self,
        stories: &[StoryCandidate],
        meetings: &[Meeting],
        top_n: usize,
    ) -> Result<Vec<String>, ProviderError> {
        if top_n == 0 || (stories.is_empty() && meetings.is_empty()) {
            return Ok(Vec::new());
        }

        let story_lines: Vec<String> = stories
            .iter()
            .map(|s| format!("- {} [{}]: {}", s.url, s.category, s.summary))
            .collect();
        let meeting_lines: Vec<String> = meetings
            .iter()
            .map(|m| {
                let when = m
                    .date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "date unknown".to_string());
                format!("- {} [{}, {}]: {}", m.url, m.title, when, m.summary)
            })
            .collect();
        let top_n = top_n.to_string();
        let stories_text = if story_lines.is_empty() {
            "(none)".to_string()
        } else {
            story_lines.join("\n")
        };
        let meetings_text = if meeting_lines.is_empty() {
            "(none)".to_string()
        } else {
            meeting_lines.join("\n")
        };

        let prompt = prompts::render(
            prompts::RANK_PROMPT,
            &[
                ("top_n", top_n.as_str()),
                ("stories", stories_text.as_str()),
                ("meetings", meetings_text.as_str()),
            ],
        );
        let answer = self.ask(&self.pro_model, prompt, 1024).await?;
        parse_ranking(&answer)
    }
}

#[async_trait::async_trait]
impl MeetingParser for PromptBackend {
    async fn parse(
        &self,
        url: &str,
        raw_text: &str,
        run_date: NaiveDate,
    ) -> Result<Meeting, ProviderError> {
        let run_date = run_date.format("%Y-%m-%d").to_string();
        let prompt = prompts::render(
            prompts::MEETING_PROMPT,
            &[
                ("run_date", run_date.as_str()),
                ("url", url),
                ("content", raw_text),
            ],
        );
        let answer = self.ask(&self.flash_model, prompt, 512).await?;
        parse_meeting(url, &answer)
    }
}

fn json_value(text: &str) -> Result<Value, ProviderError> {
    let json = extract_json_from_text(text)
        .ok_or_else(|| ProviderError::Permanent("No JSON found in model response".to_string()))?;
    serde_json::from_str(&json).map_err(|e| {
        ProviderError::Permanent(format!("Failed to parse model JSON: {} (input: {})", e, json))
    })
}

/// Non-empty string field, with `"null"` treated as absent.
fn text_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .map(str::to_string)
}

fn flag_field(v: &Value, key: &str) -> bool {
    match v.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes"),
        _ => false,
    }
}

pub fn parse_classification(text: &str) -> Result<Classification, ProviderError> {
    let v = json_value(text)?;

    let is_new = match v.get("is_new") {
        Some(Value::String(s)) => s.parse::<Newness>().map_err(ProviderError::Permanent)?,
        Some(Value::Bool(true)) => Newness::New,
        Some(Value::Bool(false)) => Newness::NotNew,
        _ => return Err(ProviderError::Permanent("missing is_new".to_string())),
    };
    let raw_category = text_field(&v, "category")
        .ok_or_else(|| ProviderError::Permanent("missing category".to_string()))?;
    let category = prompts::canonical_category(&raw_category)
        .map(str::to_string)
        .unwrap_or(raw_category);
    let summary = text_field(&v, "summary")
        .ok_or_else(|| ProviderError::Permanent("missing summary".to_string()))?;
    let is_stale = flag_field(&v, "is_stale") || category == OUTDATED_CATEGORY;

    Ok(Classification {
        is_new,
        category,
        summary,
        is_stale,
    })
}

/// Urls in the order given, duplicates dropped.
pub fn parse_ranking(text: &str) -> Result<Vec<String>, ProviderError> {
    let v = json_value(text)?;
    let items = match &v {
        Value::Array(items) => items,
        Value::Object(map) => map
            .get("top_stories")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Permanent("missing top_stories".to_string()))?,
        _ => return Err(ProviderError::Permanent("unexpected ranking shape".to_string())),
    };

    let mut urls: Vec<String> = Vec::new();
    for item in items {
        let url = match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(_) => text_field(item, "url"),
            _ => None,
        };
        if let Some(url) = url {
            if !url.is_empty() && !urls.contains(&url) {
                urls.push(url);
            }
        }
    }
    Ok(urls)
}

pub fn parse_meeting(url: &str, text: &str) -> Result<Meeting, ProviderError> {
    let v = json_value(text)?;
    let title = text_field(&v, "title")
        .ok_or_else(|| ProviderError::Permanent("missing meeting title".to_string()))?;
    let date = text_field(&v, "date")
        .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok());

    Ok(Meeting {
        url: url.to_string(),
        title,
        date,
        time: text_field(&v, "time"),
        location: text_field(&v, "location"),
        summary: text_field(&v, "summary").unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_classification() {
        let answer = "```json\n{\"is_new\": \"yes\", \"category\": \"press release\", \
                      \"summary\": \"The Governor announced grants.\", \"is_stale\": false}\n```";
        let c = parse_classification(answer).unwrap();
        assert_eq!(c.is_new, Newness::New);
        assert_eq!(c.category, "Press Release");
        assert!(!c.is_stale);
    }

    #[test]
    fn outdated_category_implies_stale() {
        let answer = r#"{"is_new": "not_new", "category": "Outdated Content", "summary": "Old notice."}"#;
        assert!(parse_classification(answer).unwrap().is_stale);
    }

    #[test]
    fn malformed_classification_is_permanent() {
        for answer in [
            "I cannot help with that.",
            r#"{"is_new": "new", "category": "Press Release"}"#,
            r#"{"is_new": "sometimes", "category": "Press Release", "summary": "x"}"#,
            r#"{"is_new": "new", "category": "Press Release", "summary": "x""#,
        ] {
            let err = parse_classification(answer).unwrap_err();
            assert!(!err.is_transient(), "{} should be permanent", answer);
        }
    }

    #[test]
    fn ranking_accepts_object_or_array() {
        let a = parse_ranking(r#"{"top_stories": ["https://b", "https://a", "https://b"]}"#).unwrap();
        assert_eq!(a, vec!["https://b", "https://a"]);
        let b = parse_ranking(r#"[{"url": "https://c"}, "https://d"]"#).unwrap();
        assert_eq!(b, vec!["https://c", "https://d"]);
    }

    #[test]
    fn meeting_fields_are_optional_except_title() {
        let m = parse_meeting(
            "https://m",
            r#"{"title": "Cannabis Control Commission", "date": "2025-10-21", "time": "10:00 AM", "location": null, "summary": "Monthly public meeting."}"#,
        )
        .unwrap();
        assert_eq!(m.date, NaiveDate::from_ymd_opt(2025, 10, 21));
        assert_eq!(m.location, None);
        assert!(parse_meeting("https://m", r#"{"date": "2025-10-21"}"#).is_err());
    }
}
