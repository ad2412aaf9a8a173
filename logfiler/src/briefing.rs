//! Briefing Assembler: turns the classified records of one partition into the daily
//! markdown briefing, plus a styled HTML rendering of it.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use pulldown_cmark::escape::escape_html;
use pulldown_cmark::{html, Options, Parser};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::classify::truncate_for_model;
use crate::dispatch::Dispatcher;
use crate::exclusion;
use crate::llm::{Meeting, MeetingParser, ModelBackend, StoryCandidate};
use crate::record::{Newness, Record};
use crate::store::RecordStore;
use common::Config;

const MEETING_ANNOUNCEMENT: &str = "Meeting Announcement";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Section {
    NewAnnouncements,
    PressReleases,
    UpcomingMeetings,
    MeetingMaterials,
    NewDocuments,
    MightBeNew,
    OtherUpdates,
}

impl Section {
    const ALL: [Section; 7] = [
        Section::NewAnnouncements,
        Section::PressReleases,
        Section::UpcomingMeetings,
        Section::MeetingMaterials,
        Section::NewDocuments,
        Section::MightBeNew,
        Section::OtherUpdates,
    ];

    fn heading(&self) -> &'static str {
        match self {
            Section::NewAnnouncements => "New announcements",
            Section::PressReleases => "Press releases",
            Section::UpcomingMeetings => "Upcoming meetings",
            Section::MeetingMaterials => "Meeting materials",
            Section::NewDocuments => "New documents",
            Section::MightBeNew => "Might be new?",
            Section::OtherUpdates => "Other updates",
        }
    }

    fn empty_note(&self) -> &'static str {
        match self {
            Section::NewAnnouncements => "_No new announcements were identified._",
            Section::PressReleases => "_No new press releases were identified._",
            Section::UpcomingMeetings => "_No upcoming meetings were identified._",
            Section::MeetingMaterials => "_No new meeting materials were identified._",
            Section::NewDocuments => "_No new documents were identified._",
            Section::MightBeNew => "_No items were flagged as possibly new._",
            Section::OtherUpdates => "_No other updates._",
        }
    }
}

fn section_for(record: &Record, meetings: &BTreeMap<String, Meeting>) -> Section {
    if record.is_new == Some(Newness::Maybe) {
        return Section::MightBeNew;
    }
    match record.category.as_deref() {
        Some("New Announcement") => Section::NewAnnouncements,
        Some("Press Release") => Section::PressReleases,
        Some(MEETING_ANNOUNCEMENT) if meetings.contains_key(&record.url) => {
            Section::UpcomingMeetings
        }
        Some("Meeting Materials") => Section::MeetingMaterials,
        Some("New Document") => Section::NewDocuments,
        _ => Section::OtherUpdates,
    }
}

/// Human date for the briefing header, e.g. "October 10, 2025".
pub fn format_briefing_date(date: NaiveDate) -> String {
    date.format("%B %-d, %Y").to_string()
}

fn write_item(out: &mut String, record: &Record, meeting: Option<&Meeting>, section: Section) {
    let summary = record.summary.as_deref().unwrap_or("No summary generated.");
    match meeting {
        Some(m) => {
            let title = if m.title.trim().is_empty() {
                record.url.as_str()
            } else {
                m.title.trim()
            };
            out.push_str(&format!("### [{}]({})\n", title, record.url));
            let when = match (&m.date, &m.time) {
                (Some(d), Some(t)) => format!("{} {}", format_briefing_date(*d), t),
                (Some(d), None) => format_briefing_date(*d),
                (None, Some(t)) => t.clone(),
                (None, None) => "N/A".to_string(),
            };
            out.push_str(&format!("**When:** {}\n", when));
            if let Some(location) = &m.location {
                out.push_str(&format!("**Where:** {}\n", location));
            }
            let detail = if m.summary.trim().is_empty() {
                summary
            } else {
                m.summary.trim()
            };
            out.push_str(&format!("**Summary:** {}\n\n", detail));
        }
        None => {
            out.push_str(&format!("### [{}]({})\n", record.url, record.url));
            out.push_str(&format!("**Summary:** {}\n", summary));
            if section == Section::NewDocuments {
                let published = record
                    .page_date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "N/A".to_string());
                out.push_str(&format!(
                    "**File Type:** {} | **Published Date:** {}\n",
                    record.filetype, published
                ));
            }
            out.push('\n');
        }
    }
}

/// Deterministic markdown over the selected records. `top` holds the ranked urls; an
/// empty list leaves out the top-stories section.
pub fn render_briefing(
    title: &str,
    date: NaiveDate,
    records: &[Record],
    meetings: &BTreeMap<String, Meeting>,
    top: &[String],
) -> String {
    let mut sorted: Vec<&Record> = records.iter().collect();
    sorted.sort_by(|a, b| a.url.cmp(&b.url));

    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", title));
    out.push_str(&format!("**{}**\n\n", format_briefing_date(date)));
    out.push_str("---\n\n");

    if !top.is_empty() {
        let by_url: BTreeMap<&str, &Record> = sorted.iter().map(|r| (r.url.as_str(), *r)).collect();
        out.push_str("## Top stories\n\n");
        for url in top {
            if let Some(record) = by_url.get(url.as_str()) {
                let section = section_for(record, meetings);
                write_item(&mut out, record, meetings.get(url), section);
            }
        }
    }

    let mut grouped: BTreeMap<Section, Vec<&Record>> = BTreeMap::new();
    for record in sorted.iter().copied() {
        grouped
            .entry(section_for(record, meetings))
            .or_default()
            .push(record);
    }

    for section in Section::ALL {
        out.push_str(&format!("## {}\n\n", section.heading()));
        match grouped.get(&section) {
            Some(items) => {
                for record in items {
                    let meeting = if section == Section::UpcomingMeetings {
                        meetings.get(&record.url)
                    } else {
                        None
                    };
                    write_item(&mut out, record, meeting, section);
                }
            }
            None => out.push_str(&format!("{}\n\n", section.empty_note())),
        }
    }

    out
}

const STYLESHEET: &str = r#"body {
  background-color: #fdf6e3;
  font-family: Arial, sans-serif;
  color: #586e75;
  line-height: 1.6;
  margin: 0;
  padding: 2em;
}
.container {
  max-width: 800px;
  margin: 0 auto;
  background-color: #eee8d5;
  padding: 2em;
  border-radius: 8px;
  box-shadow: 0 4px 8px rgba(0,0,0,0.1);
}
h1, h2, h3, h4, h5, h6 {
  color: #d33682;
  border-bottom: 1px solid #eee8d5;
  padding-bottom: 5px;
}
strong, b {
  color: #cb4b16;
  font-weight: bold;
}
a {
  color: #005b99;
  text-decoration: none;
}
a:hover {
  text-decoration: underline;
}
ul, ol {
  padding-left: 20px;
}
li {
  margin-bottom: 0.5em;
}
em {
  color: #93a1a1;
}
hr {
  border: 0;
  border-top: 1px solid #93a1a1;
  margin: 2em 0;
}"#;

/// Standalone HTML page for a rendered briefing: the markdown converted with
/// CommonMark rules inside a fixed stylesheet. Same input, same bytes.
pub fn render_html(title: &str, date: NaiveDate, markdown: &str) -> std::io::Result<String> {
    let mut body = String::new();
    html::push_html(&mut body, Parser::new_ext(markdown, Options::empty()));

    let mut page = String::from("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n");
    page.push_str("<meta charset=\"UTF-8\">\n");
    page.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n");
    page.push_str("<title>");
    escape_html(&mut page, title)?;
    page.push_str(&format!(" | {}</title>\n", format_briefing_date(date)));
    page.push_str(&format!("<style>\n{}\n</style>\n", STYLESHEET));
    page.push_str("</head>\n<body>\n<div class=\"container\">\n");
    page.push_str(&body);
    page.push_str("</div>\n</body>\n</html>\n");
    Ok(page)
}

/// Paths of the written briefing files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BriefingFiles {
    pub markdown: PathBuf,
    pub html: PathBuf,
}

/// Keep known urls in ranked order, without repeats, up to `top_n`.
pub fn filter_ranking(ranked: Vec<String>, known: &BTreeSet<&str>, top_n: usize) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ranked
        .into_iter()
        .filter(|url| known.contains(url.as_str()))
        .filter(|url| seen.insert(url.clone()))
        .take(top_n)
        .collect()
}

pub struct BriefingAssembler {
    store: RecordStore,
    backend: Arc<dyn ModelBackend>,
    parser: Arc<dyn MeetingParser>,
    flash: Arc<Dispatcher>,
    pro: Arc<Dispatcher>,
    title: String,
    output_dir: PathBuf,
    top_stories: usize,
    rank: bool,
    truncation_length: usize,
}

impl BriefingAssembler {
    pub fn new(
        store: RecordStore,
        backend: Arc<dyn ModelBackend>,
        parser: Arc<dyn MeetingParser>,
        flash: Arc<Dispatcher>,
        pro: Arc<Dispatcher>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            backend,
            parser,
            flash,
            pro,
            title: config.briefing.title(),
            output_dir: PathBuf::from(config.briefing.output_dir()),
            top_stories: config.briefing.top_stories(),
            rank: config.briefing.rank(),
            truncation_length: config.llm.truncation_length(),
        }
    }

    /// Build the briefing text for a partition.
    pub async fn assemble(&self, partition: NaiveDate, include_maybe: bool) -> Result<String> {
        let records: Vec<Record> = self
            .store
            .briefing_selection(partition, include_maybe)
            .await?
            .into_iter()
            .filter(|r| !exclusion::is_excluded(r.excluded))
            .collect();
        info!("Briefing for {} selects {} records", partition, records.len());

        let meetings = self.parse_meetings(partition, &records).await;
        let top = if self.rank && !records.is_empty() {
            self.rank_stories(&records, &meetings).await
        } else {
            Vec::new()
        };

        Ok(render_briefing(&self.title, partition, &records, &meetings, &top))
    }

    /// Assemble and write `<output_dir>/briefing_<date>.md` and its `.html` rendering.
    pub async fn write(&self, partition: NaiveDate, include_maybe: bool) -> Result<BriefingFiles> {
        let markdown = self.assemble(partition, include_maybe).await?;
        let html = render_html(&self.title, partition, &markdown).context("failed to render briefing html")?;

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("failed to create {}", self.output_dir.display()))?;
        let stem = format!("briefing_{}", partition.format("%Y-%m-%d"));
        let files = BriefingFiles {
            markdown: self.output_dir.join(format!("{}.md", stem)),
            html: self.output_dir.join(format!("{}.html", stem)),
        };
        tokio::fs::write(&files.markdown, markdown)
            .await
            .with_context(|| format!("failed to write {}", files.markdown.display()))?;
        tokio::fs::write(&files.html, html)
            .await
            .with_context(|| format!("failed to write {}", files.html.display()))?;
        info!(
            "Briefing written to {} and {}",
            files.markdown.display(),
            files.html.display()
        );
        Ok(files)
    }

    async fn parse_meetings(&self, partition: NaiveDate, records: &[Record]) -> BTreeMap<String, Meeting> {
        let mut meetings = BTreeMap::new();
        for record in records
            .iter()
            .filter(|r| r.category.as_deref() == Some(MEETING_ANNOUNCEMENT))
        {
            let text = truncate_for_model(
                record.extracted_text.as_deref().unwrap_or_default(),
                self.truncation_length,
            );
            let parser = &self.parser;
            let url = record.url.as_str();
            let raw = text.as_str();
            let label = format!("meeting {}", url);
            match self
                .flash
                .call(&label, move || parser.parse(url, raw, partition))
                .await
            {
                Ok(meeting) => {
                    meetings.insert(record.url.clone(), meeting);
                }
                Err(e) => warn!(url = %record.url, "meeting not parsed, listed as a plain update: {}", e),
            }
        }
        meetings
    }

    async fn rank_stories(&self, records: &[Record], meetings: &BTreeMap<String, Meeting>) -> Vec<String> {
        let stories: Vec<StoryCandidate> = records
            .iter()
            .filter(|r| !meetings.contains_key(&r.url))
            .map(|r| StoryCandidate {
                url: r.url.clone(),
                category: r.category.clone().unwrap_or_default(),
                summary: r.summary.clone().unwrap_or_default(),
            })
            .collect();
        let parsed: Vec<Meeting> = meetings.values().cloned().collect();

        let backend = &self.backend;
        let (stories_ref, meetings_ref) = (stories.as_slice(), parsed.as_slice());
        let top_n = self.top_stories;
        match self
            .pro
            .call("rank stories", move || backend.rank(stories_ref, meetings_ref, top_n))
            .await
        {
            Ok(ranked) => {
                let known: BTreeSet<&str> = records.iter().map(|r| r.url.as_str()).collect();
                filter_ranking(ranked, &known, self.top_stories)
            }
            Err(e) => {
                warn!("Ranking failed, briefing has no top stories: {}", e);
                Vec::new()
            }
        }
    }
}
