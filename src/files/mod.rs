//! File side: one markdown file per deck, blocks separated by `---`.

pub mod markdown;
pub mod media;
pub mod scanner;
pub mod writer;

use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
	config::Scope,
	models::deck::{DeckNameError, DeckPath},
};

#[derive(Debug, Error)]
pub enum CollectionError {
	#[error("collection directory does not exist: {0}")]
	MissingRoot(String),

	#[error("collection path is not a directory: {0}")]
	NotADirectory(String),

	#[error("permission denied: {0}")]
	PermissionDenied(String),

	#[error("I/O error on {path}: {reason}")]
	Io { path: String, reason: String },

	#[error(transparent)]
	DeckName(#[from] DeckNameError),

	#[error("deck file for '{0}' already exists")]
	DeckExists(DeckPath),

	#[error("no deck file for '{0}'")]
	UnknownDeck(DeckPath),

	#[error("deck file for '{0}' still holds notes")]
	DeckNotEmpty(DeckPath),

	#[error("block {ordinal} of '{deck}' no longer exists")]
	BlockMissing { deck: DeckPath, ordinal: usize },

	#[error("local media folder {0} is the application's own media folder")]
	MediaAliased(String),
}

#[derive(Debug, Clone)]
struct DeckFile {
	/// Raw block text; `None` once a block is removed, so ordinals stay stable.
	blocks: Vec<Option<String>>,
	on_disk: Option<PathBuf>,
	dirty: bool,
}

impl DeckFile {
	fn empty() -> Self {
		DeckFile {
			blocks: Vec::new(),
			on_disk: None,
			dirty: true,
		}
	}

	fn has_content(&self) -> bool {
		self.blocks.iter().flatten().any(|b| !b.trim().is_empty())
	}
}

/// In-memory view of the deck files of one collection directory.
///
/// Edits stay in memory until [`FileCollection::flush`].
#[derive(Debug, Clone)]
pub struct FileCollection {
	root: PathBuf,
	files: BTreeMap<DeckPath, DeckFile>,
	/// Files to remove on flush, with the deck they belonged to.
	stale_paths: Vec<(DeckPath, PathBuf)>,
	skipped: u64,
}

impl FileCollection {
	/// Read every in-scope deck file under `root`.
	pub fn load(root: &Path, scope: &Scope) -> Result<FileCollection, CollectionError> {
		let (entries, skipped) = scanner::walk_collection(root)?;
		let mut files = BTreeMap::new();
		for entry in entries {
			if !scope.contains(&entry.deck) {
				continue;
			}
			let text = writer::read_file(&entry.path)?;
			let blocks = markdown::split_blocks(&text).into_iter().map(Some).collect();
			files.insert(
				entry.deck,
				DeckFile {
					blocks,
					on_disk: Some(entry.path),
					dirty: false,
				},
			);
		}
		tracing::debug!("loaded {} deck files from {} ({skipped} skipped)", files.len(), root.display());
		Ok(FileCollection {
			root: root.to_path_buf(),
			files,
			stale_paths: Vec::new(),
			skipped,
		})
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn skipped(&self) -> u64 {
		self.skipped
	}

	pub fn decks(&self) -> impl Iterator<Item = &DeckPath> {
		self.files.keys()
	}

	pub fn has_deck(&self, deck: &DeckPath) -> bool {
		self.files.contains_key(deck)
	}

	/// Live blocks of a deck with their ordinals.
	pub fn blocks<'a>(&'a self, deck: &DeckPath) -> impl Iterator<Item = (usize, &'a str)> + 'a {
		self.files
			.get(deck)
			.into_iter()
			.flat_map(|f| f.blocks.iter().enumerate())
			.filter_map(|(i, b)| b.as_deref().map(|b| (i, b)))
	}

	pub fn block(&self, deck: &DeckPath, ordinal: usize) -> Option<&str> {
		self.files.get(deck)?.blocks.get(ordinal)?.as_deref()
	}

	pub fn create_deck(&mut self, deck: &DeckPath) -> Result<(), CollectionError> {
		if self.files.contains_key(deck) {
			return Err(CollectionError::DeckExists(deck.clone()));
		}
		deck.to_file_stem()?;
		self.files.insert(deck.clone(), DeckFile::empty());
		Ok(())
	}

	/// Rename `from` and every deck below it.
	pub fn rename_deck(&mut self, from: &DeckPath, to: &DeckPath) -> Result<(), CollectionError> {
		let moving: Vec<DeckPath> = self.files.keys().filter(|d| d.starts_with(from)).cloned().collect();
		if moving.is_empty() {
			return Err(CollectionError::UnknownDeck(from.clone()));
		}
		let mut renames = Vec::with_capacity(moving.len());
		for old in &moving {
			let Some(new) = old.rebase(from, to) else {
				continue;
			};
			if self.files.contains_key(&new) && !moving.contains(&new) {
				return Err(CollectionError::DeckExists(new));
			}
			new.to_file_stem()?;
			renames.push((old.clone(), new));
		}

		let mut moved = Vec::with_capacity(renames.len());
		for (old, new) in renames {
			if let Some(mut file) = self.files.remove(&old) {
				if let Some(path) = file.on_disk.take() {
					self.stale_paths.push((old.clone(), path));
				}
				file.dirty = true;
				moved.push((new, file));
			}
		}
		self.files.extend(moved);
		Ok(())
	}

	pub fn delete_deck(&mut self, deck: &DeckPath) -> Result<(), CollectionError> {
		let file = self.files.get(deck).ok_or_else(|| CollectionError::UnknownDeck(deck.clone()))?;
		if file.has_content() {
			return Err(CollectionError::DeckNotEmpty(deck.clone()));
		}
		if let Some(path) = self.files.remove(deck).and_then(|f| f.on_disk) {
			self.stale_paths.push((deck.clone(), path));
		}
		Ok(())
	}

	pub fn append_block(&mut self, deck: &DeckPath, text: String) -> Result<usize, CollectionError> {
		let file = self.files.get_mut(deck).ok_or_else(|| CollectionError::UnknownDeck(deck.clone()))?;
		file.blocks.push(Some(text));
		file.dirty = true;
		Ok(file.blocks.len() - 1)
	}

	pub fn replace_block(&mut self, deck: &DeckPath, ordinal: usize, text: String) -> Result<(), CollectionError> {
		let slot = self.slot_mut(deck, ordinal)?;
		*slot = Some(text);
		self.mark_dirty(deck);
		Ok(())
	}

	pub fn remove_block(&mut self, deck: &DeckPath, ordinal: usize) -> Result<String, CollectionError> {
		let slot = self.slot_mut(deck, ordinal)?;
		let old = slot.take().ok_or_else(|| CollectionError::BlockMissing {
			deck: deck.clone(),
			ordinal,
		})?;
		self.mark_dirty(deck);
		Ok(old)
	}

	/// Add a key marker to an existing block without rewriting it.
	pub fn stamp_key(&mut self, deck: &DeckPath, ordinal: usize, key: &str) -> Result<(), CollectionError> {
		let slot = self.slot_mut(deck, ordinal)?;
		let raw = slot.as_deref().ok_or_else(|| CollectionError::BlockMissing {
			deck: deck.clone(),
			ordinal,
		})?;
		*slot = Some(markdown::insert_marker(raw, key));
		self.mark_dirty(deck);
		Ok(())
	}

	fn slot_mut(&mut self, deck: &DeckPath, ordinal: usize) -> Result<&mut Option<String>, CollectionError> {
		self.files
			.get_mut(deck)
			.ok_or_else(|| CollectionError::UnknownDeck(deck.clone()))?
			.blocks
			.get_mut(ordinal)
			.ok_or_else(|| CollectionError::BlockMissing {
				deck: deck.clone(),
				ordinal,
			})
	}

	fn mark_dirty(&mut self, deck: &DeckPath) {
		if let Some(file) = self.files.get_mut(deck) {
			file.dirty = true;
		}
	}

	pub fn is_dirty(&self) -> bool {
		!self.stale_paths.is_empty() || self.files.values().any(|f| f.dirty)
	}

	/// Write changed deck files and remove stale ones.
	/// Returns the decks whose files could not be written or removed.
	pub fn flush(&mut self) -> Vec<(DeckPath, CollectionError)> {
		if !self.is_dirty() {
			return Vec::new();
		}
		let mut failures = Vec::new();
		let root = self.root.clone();

		for (deck, file) in self.files.iter_mut().filter(|(_, f)| f.dirty) {
			let path = match scanner::deck_file_path(&root, deck) {
				Ok(p) => p,
				Err(e) => {
					failures.push((deck.clone(), e));
					continue;
				}
			};
			let text = markdown::join_blocks(file.blocks.iter().flatten().map(String::as_str));
			match writer::write_atomic(&path, &text) {
				Ok(()) => {
					file.on_disk = Some(path);
					file.dirty = false;
				}
				Err(e) => failures.push((deck.clone(), e)),
			}
		}

		let live: Vec<&PathBuf> = self.files.values().filter_map(|f| f.on_disk.as_ref()).collect();
		let mut kept = Vec::new();
		for (deck, path) in self.stale_paths.drain(..) {
			if live.contains(&&path) {
				continue;
			}
			if let Err(e) = writer::remove_file(&path) {
				failures.push((deck.clone(), e));
				kept.push((deck, path));
			}
		}
		self.stale_paths = kept;

		for (deck, e) in &failures {
			tracing::error!("failed to write deck file for '{deck}': {e}");
		}
		failures
	}
}

#[cfg(test)]
mod tests {
	use std::fs;

	use super::*;

	fn deck(name: &str) -> DeckPath {
		DeckPath::parse(name).unwrap()
	}

	fn collection(files: &[(&str, &str)]) -> (tempfile::TempDir, FileCollection) {
		let tmp = tempfile::tempdir().unwrap();
		for (name, text) in files {
			fs::write(tmp.path().join(name), text).unwrap();
		}
		let c = FileCollection::load(tmp.path(), &Scope::default()).unwrap();
		(tmp, c)
	}

	#[test]
	fn load_respects_scope() {
		let (_tmp, c) = collection(&[("Default.md", "Q: x\nA: y"), ("Biology.md", "Q: a\nA: b")]);
		let decks: Vec<&DeckPath> = c.decks().collect();
		assert_eq!(decks, vec![&deck("Biology")]);
		assert!(!c.is_dirty());
		assert_eq!(c.skipped(), 0);
	}

	#[test]
	fn undecodable_file_names_are_skipped() {
		let (_tmp, mut c) = collection(&[("A___B.md", "Q: a\nA: b"), ("Good.md", "")]);
		assert_eq!(c.skipped(), 1);
		assert_eq!(c.decks().count(), 1);
		assert!(c.flush().is_empty());
	}

	#[test]
	fn rename_moves_subdecks_and_removes_old_files() {
		let (tmp, mut c) = collection(&[("Biology.md", "Q: a\nA: b"), ("Biology__Cells.md", "Q: c\nA: d")]);
		c.rename_deck(&deck("Biology"), &deck("Biology::Advanced")).unwrap();
		assert!(c.flush().is_empty());

		assert!(!tmp.path().join("Biology.md").exists());
		assert!(!tmp.path().join("Biology__Cells.md").exists());
		assert_eq!(
			fs::read_to_string(tmp.path().join("Biology__Advanced.md")).unwrap(),
			"Q: a\nA: b\n"
		);
		assert!(tmp.path().join("Biology__Advanced__Cells.md").exists());
	}

	#[test]
	fn block_edits_keep_ordinals_stable() {
		let (tmp, mut c) = collection(&[("Deck.md", "Q: 1\nA: 1\n\n---\n\nQ: 2\nA: 2\n\n---\n\nfree text")]);
		let d = deck("Deck");
		c.remove_block(&d, 0).unwrap();
		c.stamp_key(&d, 1, "K2").unwrap();
		assert_eq!(c.block(&d, 2), Some("free text"));
		let appended = c.append_block(&d, "Q: 3\nA: 3".into()).unwrap();
		assert_eq!(appended, 3);
		c.flush();

		assert_eq!(
			fs::read_to_string(tmp.path().join("Deck.md")).unwrap(),
			"<!-- note_key: K2 -->\nQ: 2\nA: 2\n\n---\n\nfree text\n\n---\n\nQ: 3\nA: 3\n"
		);
		assert!(matches!(c.remove_block(&d, 0), Err(CollectionError::BlockMissing { .. })));
	}

	#[test]
	fn delete_requires_empty_deck() {
		let (tmp, mut c) = collection(&[("Deck.md", "keep me")]);
		let d = deck("Deck");
		assert!(matches!(c.delete_deck(&d), Err(CollectionError::DeckNotEmpty(_))));
		c.remove_block(&d, 0).unwrap();
		c.delete_deck(&d).unwrap();
		c.flush();
		assert!(!tmp.path().join("Deck.md").exists());
	}

	#[test]
	fn create_rejects_existing_and_invalid_names() {
		let (_tmp, mut c) = collection(&[("Deck.md", "")]);
		assert!(matches!(c.create_deck(&deck("Deck")), Err(CollectionError::DeckExists(_))));
		assert!(matches!(c.create_deck(&deck("a/b")), Err(CollectionError::DeckName(_))));
		c.create_deck(&deck("New::Sub")).unwrap();
		assert!(c.has_deck(&deck("New::Sub")));
	}
}
