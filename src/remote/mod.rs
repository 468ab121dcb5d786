//! The flashcard collection, reached through a note and deck CRUD capability.

pub mod anki_connect;
pub mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
	deck::DeckPath,
	note_type::{KEY_FIELD, NoteType},
};

pub use anki_connect::AnkiConnect;
pub use memory::MemoryRemote;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
	#[error("collection unreachable: {0}")]
	Unreachable(String),

	#[error("{action} timed out after {secs}s")]
	Timeout { action: String, secs: u64 },

	#[error("collection rejected {action}: {reason}")]
	Rejected { action: String, reason: String },

	#[error("not found in collection: {0}")]
	NotFound(String),

	#[error("unexpected response to {action}: {reason}")]
	Decode { action: String, reason: String },
}

impl RemoteError {
	/// Network-level failures may succeed on a second attempt.
	pub fn is_retryable(&self) -> bool {
		matches!(self, RemoteError::Unreachable(_) | RemoteError::Timeout { .. })
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDeck {
	pub id: i64,
	pub path: DeckPath,
}

/// A note as the collection stores it: rich-text field values, key field included.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
	pub id: i64,
	pub note_type: String,
	pub fields: Vec<(String, String)>,
	pub deck: DeckPath,
}

impl RemoteRecord {
	/// Key embedded in the reserved field, if any.
	pub fn embedded_key(&self) -> Option<&str> {
		self.fields
			.iter()
			.find(|(n, _)| n == KEY_FIELD)
			.map(|(_, v)| v.trim())
			.filter(|v| !v.is_empty())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRemoteRecord {
	pub note_type: String,
	pub fields: Vec<(String, String)>,
	pub deck: RemoteDeck,
}

/// What declaring a note type did to the collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteTypeChange {
	Unchanged,
	Created,
	FieldsAdded(Vec<String>),
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
	async fn list_decks(&self) -> Result<Vec<RemoteDeck>, RemoteError>;

	/// Notes directly in `deck`, subdecks excluded.
	async fn list_records_in_deck(&self, deck: &RemoteDeck) -> Result<Vec<RemoteRecord>, RemoteError>;

	async fn create_record(&self, record: NewRemoteRecord) -> Result<i64, RemoteError>;

	/// Overwrite the given fields; fields not listed keep their value.
	async fn update_record_fields(&self, id: i64, fields: Vec<(String, String)>) -> Result<(), RemoteError>;

	async fn stamp_key(&self, id: i64, key: &str) -> Result<(), RemoteError> {
		self.update_record_fields(id, vec![(KEY_FIELD.to_string(), key.to_string())])
			.await
	}

	async fn move_record(&self, id: i64, deck: &RemoteDeck) -> Result<(), RemoteError>;

	async fn delete_record(&self, id: i64) -> Result<(), RemoteError>;

	/// Create `path` (and missing parents). Returns the deck id.
	async fn create_deck(&self, path: &DeckPath) -> Result<i64, RemoteError>;

	/// Rename a deck with its subdecks. Returns the id the deck has afterwards.
	async fn rename_deck(&self, id: i64, to: &DeckPath) -> Result<i64, RemoteError>;

	async fn delete_deck(&self, deck: &RemoteDeck) -> Result<(), RemoteError>;

	/// Make sure the collection has a model named like `note_type` carrying all of
	/// its fields plus the key field. Existing models only ever gain fields.
	async fn ensure_note_type(&self, note_type: &NoteType) -> Result<NoteTypeChange, RemoteError>;

	/// Folder the application keeps media files in, if it is reachable from here.
	async fn media_dir(&self) -> Result<Option<PathBuf>, RemoteError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn retryable_classification() {
		assert!(RemoteError::Unreachable("down".into()).is_retryable());
		assert!(RemoteError::Timeout { action: "addNote".into(), secs: 10 }.is_retryable());
		assert!(!RemoteError::NotFound("note 1".into()).is_retryable());
		assert!(!RemoteError::Rejected { action: "addNote".into(), reason: "dup".into() }.is_retryable());
		assert!(!RemoteError::Decode { action: "x".into(), reason: "y".into() }.is_retryable());
	}

	#[test]
	fn embedded_key_ignores_blank_values() {
		let mut record = RemoteRecord {
			id: 1,
			note_type: "CardSyncQA".into(),
			fields: vec![("Question".into(), "q".into()), (KEY_FIELD.into(), "  ".into())],
			deck: DeckPath::parse("D").unwrap(),
		};
		assert_eq!(record.embedded_key(), None);
		record.fields[1].1 = " K1 ".into();
		assert_eq!(record.embedded_key(), Some("K1"));
	}
}
