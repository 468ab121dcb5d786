use std::path::{Path, PathBuf};

use crate::{
	db::{DbHandle, StoreError, STORE_FORMAT},
	engine::snapshot::Snapshot,
	models::{
		deck::DeckPath,
		mapping::{DeckRow, MappingDelta, MappingState, NoteRow},
		record::ContentHash,
	},
};

/// Outcome of reading the store.
#[derive(Debug)]
pub enum Loaded {
	Ready(MappingState),
	/// Unreadable as a whole; nothing of it is used.
	Corrupted { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebuildReport {
	/// Where the unreadable store was moved, if it was on disk.
	pub moved_to: Option<PathBuf>,
	pub matched: usize,
	/// File-side keys with no collection note carrying the same key.
	pub unmatched: Vec<String>,
}

/// Durable key <-> note id mapping, owned by one pass at a time.
pub struct MappingStore {
	path: Option<PathBuf>,
	handle: Option<DbHandle>,
}

impl MappingStore {
	/// Store on disk at `path`.
	pub fn at(path: impl Into<PathBuf>) -> Self {
		MappingStore {
			path: Some(path.into()),
			handle: None,
		}
	}

	/// Volatile store; nothing survives the process.
	pub fn in_memory() -> Self {
		MappingStore {
			path: None,
			handle: None,
		}
	}

	pub fn path(&self) -> Option<&Path> {
		self.path.as_deref()
	}

	/// Read every row. With `create_missing` unset a missing store reads as empty
	/// and nothing is created.
	pub async fn load(&mut self, create_missing: bool) -> Result<Loaded, StoreError> {
		if self.handle.is_none() {
			match &self.path {
				Some(path) if !path.exists() => {
					if !create_missing {
						return Ok(Loaded::Ready(MappingState::default()));
					}
					let handle = DbHandle::open(path).await?;
					handle.write_format().await?;
					tracing::info!("created mapping store at {}", path.display());
					self.handle = Some(handle);
				}
				Some(path) => {
					if !path.is_dir() {
						return Ok(Loaded::Corrupted {
							reason: format!("{} is not a store directory", path.display()),
						});
					}
					match DbHandle::open(path).await {
						Ok(handle) => self.handle = Some(handle),
						Err(e) => return Ok(Loaded::Corrupted { reason: e.to_string() }),
					}
				}
				None => {
					let handle = DbHandle::memory().await?;
					handle.write_format().await?;
					self.handle = Some(handle);
				}
			}
		}
		let Some(handle) = &self.handle else {
			return Ok(Loaded::Ready(MappingState::default()));
		};
		Ok(match read_state(handle).await {
			Ok(state) => {
				tracing::debug!("mapping store holds {} notes, {} decks", state.note_count(), state.deck_count());
				Loaded::Ready(state)
			}
			Err(reason) => {
				self.handle = None;
				Loaded::Corrupted { reason }
			}
		})
	}

	/// Replace an unreadable store with one rebuilt from key markers, and persist it.
	pub async fn rebuild_from_markers(
		&mut self,
		files: &Snapshot,
		remote: &Snapshot,
	) -> Result<(MappingState, RebuildReport), StoreError> {
		self.handle = None;
		let (state, mut report) = reconstruct(files, remote);

		let handle = match &self.path {
			Some(path) => {
				if path.exists() {
					let target = corrupt_target(path);
					std::fs::rename(path, &target).map_err(|e| StoreError::Io {
						path: path.display().to_string(),
						reason: e.to_string(),
					})?;
					tracing::warn!("moved unreadable mapping store to {}", target.display());
					report.moved_to = Some(target);
				}
				DbHandle::open(path).await?
			}
			None => DbHandle::memory().await?,
		};
		handle.write_format().await?;
		handle
			.commit(&MappingDelta {
				upsert_notes: state.notes().cloned().collect(),
				upsert_decks: state.decks().collect(),
				..Default::default()
			})
			.await?;
		self.handle = Some(handle);

		tracing::info!(
			"rebuilt mapping store: {} notes matched, {} keys without a collection note",
			report.matched,
			report.unmatched.len()
		);
		Ok((state, report))
	}

	/// Write one pass's row changes in a single transaction.
	pub async fn commit(&mut self, delta: &MappingDelta) -> Result<(), StoreError> {
		if delta.is_empty() {
			return Ok(());
		}
		let handle = self
			.handle
			.as_ref()
			.ok_or_else(|| StoreError::Query("mapping store is not open".to_string()))?;
		handle.commit(delta).await?;
		tracing::debug!("committed {} mapping rows", delta.row_count());
		Ok(())
	}
}

async fn read_state(handle: &DbHandle) -> Result<MappingState, String> {
	match handle.read_format().await {
		Ok(Some(STORE_FORMAT)) => {}
		Ok(Some(other)) => return Err(format!("unknown store format {other}")),
		Ok(None) => return Err("store has no format record".to_string()),
		Err(e) => return Err(e.to_string()),
	}
	let notes = handle.note_rows().await.map_err(|e| e.to_string())?;
	let decks = handle.deck_rows().await.map_err(|e| e.to_string())?;

	let notes = notes
		.into_iter()
		.map(|row| {
			let deck_path = DeckPath::parse(&row.deck_path).map_err(|e| format!("note row '{}': {e}", row.note_key))?;
			Ok(NoteRow {
				key: row.note_key,
				remote_id: row.remote_id,
				deck_remote_id: row.deck_remote_id,
				content_hash: ContentHash::stored(row.content_hash),
				deck_path,
			})
		})
		.collect::<Result<Vec<_>, String>>()?;
	let decks = decks
		.into_iter()
		.map(|row| {
			Ok(DeckRow {
				path: DeckPath::parse(&row.deck_path).map_err(|e| format!("deck row '{}': {e}", row.deck_path))?,
				remote_id: row.deck_remote_id,
			})
		})
		.collect::<Result<Vec<_>, String>>()?;
	MappingState::from_rows(notes, decks)
}

/// Rows implied by keys present on both sides. Hashes are unknown: there is no baseline.
pub fn reconstruct(files: &Snapshot, remote: &Snapshot) -> (MappingState, RebuildReport) {
	let mut state = MappingState::default();
	let mut report = RebuildReport::default();

	for key in files.records().iter().filter_map(|r| r.key.as_deref()) {
		let Some((remote_id, deck)) = remote.get(key).and_then(|r| Some((r.remote_id()?, &r.deck))) else {
			report.unmatched.push(key.to_string());
			continue;
		};
		let Some(deck_id) = remote.deck_id(deck) else {
			report.unmatched.push(key.to_string());
			continue;
		};
		state.upsert_note(NoteRow {
			key: key.to_string(),
			remote_id,
			deck_remote_id: deck_id,
			content_hash: ContentHash::unknown(),
			deck_path: deck.clone(),
		});
		state.upsert_deck(DeckRow {
			path: deck.clone(),
			remote_id: deck_id,
		});
		report.matched += 1;
	}
	for key in &report.unmatched {
		tracing::warn!("no collection note carries key '{key}'; continuity for it is lost");
	}
	state.reconstructed = true;
	(state, report)
}

/// `<path>.corrupt`, or the first free `<path>.corrupt.N`.
fn corrupt_target(path: &Path) -> PathBuf {
	let base = format!("{}.corrupt", path.display());
	let first = PathBuf::from(&base);
	if !first.exists() {
		return first;
	}
	(1..)
		.map(|n| PathBuf::from(format!("{base}.{n}")))
		.find(|p| !p.exists())
		.unwrap_or(first)
}

#[cfg(test)]
mod tests {
	use std::fs;

	use super::*;
	use crate::{
		config::Scope,
		models::{
			operation::Side,
			record::{Fields, Origin, Record},
		},
	};

	fn deck(name: &str) -> DeckPath {
		DeckPath::parse(name).unwrap()
	}

	fn record(key: &str, deck_name: &str, origin: Origin) -> Record {
		let fields = Fields::from_pairs(vec![("Question".to_string(), "q".to_string())]);
		Record::new(Some(key.to_string()), "CardSyncQA", fields, deck(deck_name), origin)
	}

	fn sides() -> (Snapshot, Snapshot) {
		let mut files = Snapshot::new(Side::Files, Scope::default());
		files.add_record(record("K1", "Biology", Origin::File { ordinal: 0 }));
		files.add_record(record("K2", "Biology", Origin::File { ordinal: 1 }));
		let mut remote = Snapshot::new(Side::Remote, Scope::default());
		remote.add_deck(deck("Biology"), Some(7));
		remote.add_record(record("K1", "Biology", Origin::Remote(100)));
		(files, remote)
	}

	#[tokio::test]
	async fn memory_store_commits_and_reloads() {
		let mut store = MappingStore::in_memory();
		let Loaded::Ready(state) = store.load(true).await.unwrap() else {
			panic!("fresh store should be readable");
		};
		assert_eq!(state.note_count(), 0);

		let delta = MappingDelta {
			upsert_notes: vec![NoteRow {
				key: "K1".into(),
				remote_id: 100,
				deck_remote_id: 7,
				content_hash: ContentHash::stored("abcd".into()),
				deck_path: deck("Biology"),
			}],
			upsert_decks: vec![DeckRow {
				path: deck("Biology"),
				remote_id: 7,
			}],
			..Default::default()
		};
		store.commit(&delta).await.unwrap();

		let Loaded::Ready(state) = store.load(true).await.unwrap() else {
			panic!("store should still be readable");
		};
		assert_eq!(state.key_for_remote(100), Some("K1"));
		assert_eq!(state.deck_id(&deck("Biology")), Some(7));
	}

	#[tokio::test]
	async fn missing_store_is_not_created_without_permission() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("store.db");
		let mut store = MappingStore::at(&path);
		assert!(matches!(store.load(false).await.unwrap(), Loaded::Ready(s) if s.note_count() == 0));
		assert!(!path.exists());
	}

	#[tokio::test]
	async fn garbage_file_is_corrupted() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("store.db");
		fs::write(&path, b"not a database").unwrap();
		let mut store = MappingStore::at(&path);
		assert!(matches!(store.load(true).await.unwrap(), Loaded::Corrupted { .. }));
	}

	#[tokio::test]
	async fn rebuild_moves_the_old_store_aside() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("store.db");
		fs::write(&path, b"not a database").unwrap();
		fs::write(tmp.path().join("store.db.corrupt"), b"older").unwrap();
		let (files, remote) = sides();

		let mut store = MappingStore::at(&path);
		let (state, report) = store.rebuild_from_markers(&files, &remote).await.unwrap();

		assert_eq!(report.moved_to, Some(tmp.path().join("store.db.corrupt.1")));
		assert_eq!(fs::read(tmp.path().join("store.db.corrupt.1")).unwrap(), b"not a database");
		assert_eq!(report.matched, 1);
		assert_eq!(report.unmatched, vec!["K2".to_string()]);
		assert!(state.reconstructed);
		assert_eq!(state.key_for_remote(100), Some("K1"));
		assert!(state.note("K1").unwrap().content_hash.is_unknown());
		assert!(path.is_dir());

		let Loaded::Ready(reloaded) = store.load(true).await.unwrap() else {
			panic!("rebuilt store should be readable");
		};
		assert_eq!(reloaded.note_count(), 1);
		assert_eq!(reloaded.deck_id(&deck("Biology")), Some(7));
	}
}
