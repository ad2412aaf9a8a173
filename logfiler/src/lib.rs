// Library interface for logfiler modules
// This allows tests and the binary to import modules

pub mod briefing;
pub mod classify;
pub mod discovery;
pub mod dispatch;
pub mod document;
pub mod error;
pub mod exclusion;
pub mod extract;
pub mod llm;
pub mod pipeline;
pub mod record;
pub mod retry;
pub mod scrape;
pub mod store;
