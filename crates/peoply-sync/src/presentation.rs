//! The presentation collaborator interface: the only thing outside the
//! engine that sees `EventRecord`s. Real Discord delivery is out of scope
//! here; `LoggingPresentation` below is the illustrative stand-in the host
//! program ships with.

use async_trait::async_trait;
use snafu::Snafu;
use tracing::info;

use crate::model::{ChangeKind, EventRecord};

const LOG_TARGET: &str = "sync::presentation";

#[derive(Debug, Snafu)]
pub enum PresentationError {
    #[snafu(display("failed to publish announcement for {event_id}: {details}"))]
    Publish { event_id: String, details: String },
}

pub type PresentationResult<T> = std::result::Result<T, PresentationError>;

/// Implemented by whatever renders and delivers announcements for a
/// reconciled event. The engine never calls this itself; the host program's
/// presentation loop calls `Engine::drain_outbound` and hands each entry
/// here.
#[async_trait]
pub trait Presentation: Send + Sync {
    async fn publish(
        &self,
        record: &EventRecord,
        change: ChangeKind,
    ) -> PresentationResult<()>;
}

/// Renders the Discord announcement text and logs it instead of calling the
/// Discord API. Not a real delivery surface — see module docs.
#[derive(Debug, Default)]
pub struct LoggingPresentation;

impl LoggingPresentation {
    /// `"## 🔔 {title}\n{description}\n__**Når?**__ {when}\n__**Hvor?**__
    /// {place}\n__**Påmelding:**__ {link}\n"`.
    pub fn render(record: &EventRecord) -> String {
        format!(
            "## \u{1F514} {title}\n{description}\n__**N\u{e5}r?**__ {when}\n__**Hvor?**__ {place}\n__**P\u{e5}melding:**__ {link}\n",
            title = record.title,
            description = record.description,
            when = record.start_at,
            place = record.place,
            link = record.link,
        )
    }
}

#[async_trait]
impl Presentation for LoggingPresentation {
    async fn publish(
        &self,
        record: &EventRecord,
        change: ChangeKind,
    ) -> PresentationResult<()> {
        let text = Self::render(record);
        info!(
            target: LOG_TARGET,
            event_id = %record.id,
            change = ?change,
            announcement = %text,
            "publishing announcement"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> EventRecord {
        EventRecord {
            id: "e1".to_string(),
            title: "Rust Meetup".to_string(),
            description: "Talks and pizza.".to_string(),
            start_at: "2099-01-01T18:00:00.000Z".to_string(),
            updated_at: "2025-01-01T00:00:00.000Z".to_string(),
            place: "Oslo".to_string(),
            link: "https://peoply.app/events/e1".to_string(),
        }
    }

    #[test]
    fn render_produces_the_expected_announcement_shape() {
        let text = LoggingPresentation::render(&record());
        assert!(text.starts_with("## \u{1F514} Rust Meetup\n"));
        assert!(text.contains("Talks and pizza."));
        assert!(text.contains("__**N\u{e5}r?**__ 2099-01-01T18:00:00.000Z"));
        assert!(text.contains("__**Hvor?**__ Oslo"));
        assert!(text.contains("__**P\u{e5}melding:**__ https://peoply.app/events/e1"));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn logging_presentation_publish_never_fails() {
        let presentation = LoggingPresentation;
        let result = presentation.publish(&record(), ChangeKind::New).await;
        assert!(result.is_ok());
    }
}
