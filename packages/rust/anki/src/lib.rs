//! Flashcard-store bridge for cardpipe.
//!
//! Talks to AnkiConnect over local HTTP, exports a deck into the pipeline's
//! input collection, applies validated output artifacts back to notes, and
//! collapses subject subtags.

pub mod client;
pub mod export;
pub mod strip;
pub mod updater;

pub use client::{AnkiClient, NoteField, NoteInfo};
pub use export::{ExportedNote, deck_query, fetch_deck, flatten_note};
pub use strip::{StripReport, strip_subject_tags, subtag_query};
pub use updater::{ApplyReport, FileReport, Updater, detect_schema, subject_of};
