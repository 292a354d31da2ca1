//! Canonical event record, the raw upstream wire shape, and the
//! classification emitted to the outbound queue.

use bincode::{Decode, Encode};
use serde::Deserialize;
use url::Url;

use crate::clock::{Instant, SENTINEL};

/// The upstream JSON shape, kept distinct from [`EventRecord`] so that the
/// field-defaulting rules are applied in exactly one place: the reconciler.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEventPayload {
    pub url_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_date: Option<String>,
    pub updated_at: Option<String>,
    pub location_name: Option<String>,
}

/// The literal used in place of an absent string field.
pub const NULL_STRING: &str = "null";

/// The canonical, durable representation of one upstream event.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct EventRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Millisecond-precision UTC instant, stored in its ISO-8601 string form.
    pub start_at: String,
    pub updated_at: String,
    pub place: String,
    pub link: String,
}

impl EventRecord {
    pub fn start_at_instant(&self) -> Option<Instant> {
        Instant::parse(&self.start_at).ok()
    }

    pub fn updated_at_instant(&self) -> Option<Instant> {
        Instant::parse(&self.updated_at).ok()
    }

    /// Typed view of `link`; the stored form stays a plain string so
    /// `bincode`/`redb` never need to know about `url::Url`.
    pub fn link_url(&self) -> Option<Url> {
        Url::parse(&self.link).ok()
    }
}

/// Builds the canonical record from a raw payload and the derived link.
///
/// The caller is responsible for having already rejected payloads missing
/// `urlId` or `updatedAt`.
pub fn build_record(payload: &RawEventPayload, base_url: &str, id: String) -> EventRecord {
    let start_at = match &payload.start_date {
        Some(s) => Instant::parse(s).unwrap_or(SENTINEL).format(),
        None => SENTINEL.format(),
    };
    let updated_at = match &payload.updated_at {
        Some(s) => Instant::parse(s).unwrap_or(SENTINEL).format(),
        None => SENTINEL.format(),
    };

    EventRecord {
        link: format!("{base_url}/events/{id}"),
        id,
        title: payload.title.clone().unwrap_or_else(|| NULL_STRING.to_string()),
        description: payload
            .description
            .clone()
            .unwrap_or_else(|| NULL_STRING.to_string()),
        start_at,
        updated_at,
        place: payload
            .location_name
            .clone()
            .unwrap_or_else(|| NULL_STRING.to_string()),
    }
}

/// Classification of a change reaching the outbound queue. Only `New` and
/// `Updated` ever reach it; `Unchanged` events are never enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    New,
    Updated,
}
