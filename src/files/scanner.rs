use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::{files::CollectionError, models::deck::DeckPath};

pub const DECK_EXTENSION: &str = "md";

#[derive(Debug, Clone, PartialEq)]
pub struct DeckFileEntry {
	pub deck: DeckPath,
	pub path: PathBuf,
}

/// List the deck files directly under `root`.
///
/// Returns the entries plus the number of entries skipped (symlinks,
/// unreadable entries, stems that do not decode to a deck name).
pub fn walk_collection(root: &Path) -> Result<(Vec<DeckFileEntry>, u64), CollectionError> {
	if !root.exists() {
		return Err(CollectionError::MissingRoot(root.display().to_string()));
	}
	if !root.is_dir() {
		return Err(CollectionError::NotADirectory(root.display().to_string()));
	}

	let mut entries = Vec::new();
	let mut skipped = 0u64;

	for result in WalkDir::new(root).min_depth(1).max_depth(1).follow_links(false) {
		let entry = match result {
			Ok(e) => e,
			Err(_) => {
				skipped += 1;
				continue;
			}
		};

		if entry.file_type().is_dir() {
			continue;
		}
		if entry.file_type().is_symlink() {
			skipped += 1;
			continue;
		}

		let path = entry.path();
		if path.extension().and_then(|e| e.to_str()) != Some(DECK_EXTENSION) {
			continue;
		}
		let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
			skipped += 1;
			continue;
		};

		match DeckPath::from_file_stem(stem) {
			Ok(deck) => entries.push(DeckFileEntry {
				deck,
				path: path.to_path_buf(),
			}),
			Err(e) => {
				tracing::warn!("skipping {}: {e}", path.display());
				skipped += 1;
			}
		}
	}

	entries.sort_by(|a, b| a.deck.cmp(&b.deck));
	Ok((entries, skipped))
}

pub fn deck_file_path(root: &Path, deck: &DeckPath) -> Result<PathBuf, CollectionError> {
	Ok(root.join(format!("{}.{DECK_EXTENSION}", deck.to_file_stem()?)))
}
