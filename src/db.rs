use std::path::Path;

use surrealdb::{
	engine::local::{Db, Mem, SurrealKv},
	types::SurrealValue,
	Surreal,
};
use thiserror::Error;

use crate::models::mapping::{DeckRow, MappingDelta, NoteRow};

/// Version written to `meta:store`. Any other value is treated as unreadable.
pub const STORE_FORMAT: i64 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("failed to open mapping store at {path}: {reason}")]
	Open { path: String, reason: String },

	#[error("mapping store query failed: {0}")]
	Query(String),

	#[error("mapping store I/O error on {path}: {reason}")]
	Io { path: String, reason: String },
}

/// Wrapper around the SurrealDB handle.
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct DbHandle {
	pub db: Surreal<Db>,
}

#[derive(Debug, Clone, SurrealValue)]
pub struct NoteMapRow {
	pub note_key: String,
	pub remote_id: i64,
	pub deck_remote_id: i64,
	pub content_hash: String,
	pub deck_path: String,
}

#[derive(Debug, Clone, SurrealValue)]
pub struct DeckMapRow {
	pub deck_path: String,
	pub deck_remote_id: i64,
}

#[derive(Debug, Clone, SurrealValue)]
struct MetaRow {
	format: i64,
}

impl From<&NoteRow> for NoteMapRow {
	fn from(row: &NoteRow) -> Self {
		NoteMapRow {
			note_key: row.key.clone(),
			remote_id: row.remote_id,
			deck_remote_id: row.deck_remote_id,
			content_hash: row.content_hash.as_str().to_string(),
			deck_path: row.deck_path.name(),
		}
	}
}

impl From<&DeckRow> for DeckMapRow {
	fn from(row: &DeckRow) -> Self {
		DeckMapRow {
			deck_path: row.path.name(),
			deck_remote_id: row.remote_id,
		}
	}
}

impl DbHandle {
	/// Open (or create) an on-disk store and apply the schema.
	pub async fn open(path: &Path) -> Result<DbHandle, StoreError> {
		let db = Surreal::new::<SurrealKv>(path.to_path_buf()).await.map_err(|e| StoreError::Open {
			path: path.display().to_string(),
			reason: e.to_string(),
		})?;
		Self::init(db).await
	}

	/// Volatile store, used for dry runs and tests.
	pub async fn memory() -> Result<DbHandle, StoreError> {
		let db = Surreal::new::<Mem>(()).await.map_err(|e| StoreError::Open {
			path: "memory".to_string(),
			reason: e.to_string(),
		})?;
		Self::init(db).await
	}

	async fn init(db: Surreal<Db>) -> Result<DbHandle, StoreError> {
		db.use_ns("cardsync")
			.use_db("cardsync")
			.await
			.map_err(|e| StoreError::Query(e.to_string()))?;
		let handle = DbHandle { db };
		handle.run_migrations().await?;
		Ok(handle)
	}

	/// DEFINE statements are idempotent.
	async fn run_migrations(&self) -> Result<(), StoreError> {
		self.db
			.query(SCHEMA_V1)
			.await
			.map_err(|e| StoreError::Query(e.to_string()))?
			.check()
			.map_err(|e| StoreError::Query(e.to_string()))?;
		Ok(())
	}

	pub async fn read_format(&self) -> Result<Option<i64>, StoreError> {
		let mut resp = self
			.db
			.query("SELECT format FROM meta:store")
			.await
			.map_err(|e| StoreError::Query(e.to_string()))?;
		let rows: Vec<MetaRow> = resp.take(0).map_err(|e| StoreError::Query(e.to_string()))?;
		Ok(rows.first().map(|r| r.format))
	}

	pub async fn write_format(&self) -> Result<(), StoreError> {
		self.db
			.query("UPSERT meta:store CONTENT { format: $format }")
			.bind(("format", STORE_FORMAT))
			.await
			.map_err(|e| StoreError::Query(e.to_string()))?
			.check()
			.map_err(|e| StoreError::Query(e.to_string()))?;
		Ok(())
	}

	pub async fn note_rows(&self) -> Result<Vec<NoteMapRow>, StoreError> {
		let mut resp = self
			.db
			.query("SELECT note_key, remote_id, deck_remote_id, content_hash, deck_path FROM note_map")
			.await
			.map_err(|e| StoreError::Query(e.to_string()))?;
		resp.take(0).map_err(|e| StoreError::Query(e.to_string()))
	}

	pub async fn deck_rows(&self) -> Result<Vec<DeckMapRow>, StoreError> {
		let mut resp = self
			.db
			.query("SELECT deck_path, deck_remote_id FROM deck_map")
			.await
			.map_err(|e| StoreError::Query(e.to_string()))?;
		resp.take(0).map_err(|e| StoreError::Query(e.to_string()))
	}

	/// Write every row change of a pass in one transaction.
	pub async fn commit(&self, delta: &MappingDelta) -> Result<(), StoreError> {
		let notes: Vec<NoteMapRow> = delta.upsert_notes.iter().map(NoteMapRow::from).collect();
		let decks: Vec<DeckMapRow> = delta.upsert_decks.iter().map(DeckMapRow::from).collect();
		let removed_decks: Vec<String> = delta.remove_decks.iter().map(|p| p.name()).collect();

		self.db
			.query(COMMIT_DELTA)
			.bind(("removed_notes", delta.remove_notes.clone()))
			.bind(("removed_decks", removed_decks))
			.bind(("notes", notes))
			.bind(("decks", decks))
			.await
			.map_err(|e| StoreError::Query(e.to_string()))?
			.check()
			.map_err(|e| StoreError::Query(e.to_string()))?;
		Ok(())
	}
}

// A row for a key or remote id replaces any row holding either.
const COMMIT_DELTA: &str = "
    BEGIN TRANSACTION;
    DELETE note_map WHERE note_key IN $removed_notes;
    DELETE deck_map WHERE deck_path IN $removed_decks;
    FOR $row IN $notes {
        DELETE note_map WHERE note_key = $row.note_key OR remote_id = $row.remote_id;
        CREATE note_map CONTENT $row;
    };
    FOR $row IN $decks {
        DELETE deck_map WHERE deck_path = $row.deck_path OR deck_remote_id = $row.deck_remote_id;
        CREATE deck_map CONTENT $row;
    };
    COMMIT TRANSACTION;
";

const SCHEMA_V1: &str = "
    DEFINE TABLE OVERWRITE meta SCHEMAFULL;
    DEFINE FIELD OVERWRITE format ON meta TYPE int;

    DEFINE TABLE OVERWRITE note_map SCHEMAFULL;
    DEFINE FIELD OVERWRITE note_key ON note_map TYPE string;
    DEFINE FIELD OVERWRITE remote_id ON note_map TYPE int;
    DEFINE FIELD OVERWRITE deck_remote_id ON note_map TYPE int;
    DEFINE FIELD OVERWRITE content_hash ON note_map TYPE string;
    DEFINE FIELD OVERWRITE deck_path ON note_map TYPE string;
    DEFINE INDEX OVERWRITE idx_note_key ON note_map FIELDS note_key UNIQUE;
    DEFINE INDEX OVERWRITE idx_note_remote ON note_map FIELDS remote_id UNIQUE;

    DEFINE TABLE OVERWRITE deck_map SCHEMAFULL;
    DEFINE FIELD OVERWRITE deck_path ON deck_map TYPE string;
    DEFINE FIELD OVERWRITE deck_remote_id ON deck_map TYPE int;
    DEFINE INDEX OVERWRITE idx_deck_path ON deck_map FIELDS deck_path UNIQUE;
    DEFINE INDEX OVERWRITE idx_deck_remote ON deck_map FIELDS deck_remote_id UNIQUE;
";
