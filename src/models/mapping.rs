use std::collections::{BTreeMap, HashMap};

use crate::models::{deck::DeckPath, record::ContentHash};

/// One persisted note identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteRow {
	pub key: String,
	pub remote_id: i64,
	pub deck_remote_id: i64,
	pub content_hash: ContentHash,
	pub deck_path: DeckPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeckRow {
	pub path: DeckPath,
	pub remote_id: i64,
}

/// Row changes produced by one pass, committed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingDelta {
	pub upsert_notes: Vec<NoteRow>,
	pub remove_notes: Vec<String>,
	pub upsert_decks: Vec<DeckRow>,
	pub remove_decks: Vec<DeckPath>,
}

impl MappingDelta {
	pub fn is_empty(&self) -> bool {
		self.upsert_notes.is_empty()
			&& self.remove_notes.is_empty()
			&& self.upsert_decks.is_empty()
			&& self.remove_decks.is_empty()
	}

	pub fn row_count(&self) -> usize {
		self.upsert_notes.len() + self.remove_notes.len() + self.upsert_decks.len() + self.remove_decks.len()
	}
}

/// In-memory key <-> remote id bijection plus the deck table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingState {
	notes: BTreeMap<String, NoteRow>,
	key_by_remote: HashMap<i64, String>,
	decks: BTreeMap<DeckPath, i64>,
	deck_by_remote: HashMap<i64, DeckPath>,
	/// Rebuilt from markers during this pass; hashes carry no baseline.
	pub reconstructed: bool,
}

impl MappingState {
	/// Build from persisted rows. Any duplicate key or id is reported, not evicted.
	pub fn from_rows(notes: Vec<NoteRow>, decks: Vec<DeckRow>) -> Result<Self, String> {
		let mut state = MappingState::default();
		for row in notes {
			if state.notes.contains_key(&row.key) {
				return Err(format!("duplicate note key '{}'", row.key));
			}
			if let Some(other) = state.key_by_remote.get(&row.remote_id) {
				return Err(format!(
					"remote id {} bound to both '{}' and '{}'",
					row.remote_id, other, row.key
				));
			}
			state.key_by_remote.insert(row.remote_id, row.key.clone());
			state.notes.insert(row.key.clone(), row);
		}
		for row in decks {
			if state.decks.contains_key(&row.path) {
				return Err(format!("duplicate deck path '{}'", row.path));
			}
			if let Some(other) = state.deck_by_remote.get(&row.remote_id) {
				return Err(format!(
					"deck id {} bound to both '{}' and '{}'",
					row.remote_id, other, row.path
				));
			}
			state.deck_by_remote.insert(row.remote_id, row.path.clone());
			state.decks.insert(row.path.clone(), row.remote_id);
		}
		Ok(state)
	}

	pub fn note(&self, key: &str) -> Option<&NoteRow> {
		self.notes.get(key)
	}

	pub fn key_for_remote(&self, remote_id: i64) -> Option<&str> {
		self.key_by_remote.get(&remote_id).map(String::as_str)
	}

	pub fn notes(&self) -> impl Iterator<Item = &NoteRow> {
		self.notes.values()
	}

	pub fn note_count(&self) -> usize {
		self.notes.len()
	}

	pub fn deck_id(&self, path: &DeckPath) -> Option<i64> {
		self.decks.get(path).copied()
	}

	pub fn deck_path_for(&self, remote_id: i64) -> Option<&DeckPath> {
		self.deck_by_remote.get(&remote_id)
	}

	pub fn decks(&self) -> impl Iterator<Item = DeckRow> + '_ {
		self.decks.iter().map(|(path, id)| DeckRow {
			path: path.clone(),
			remote_id: *id,
		})
	}

	pub fn deck_count(&self) -> usize {
		self.decks.len()
	}

	/// Insert a row, first evicting any row that holds the same key or remote id.
	pub fn upsert_note(&mut self, row: NoteRow) -> Vec<NoteRow> {
		let mut evicted = Vec::new();
		if let Some(old) = self.remove_note(&row.key) {
			if old.remote_id != row.remote_id {
				evicted.push(old);
			}
		}
		if let Some(holder) = self.key_by_remote.get(&row.remote_id).cloned() {
			if let Some(old) = self.remove_note(&holder) {
				evicted.push(old);
			}
		}
		self.key_by_remote.insert(row.remote_id, row.key.clone());
		self.notes.insert(row.key.clone(), row);
		evicted
	}

	pub fn remove_note(&mut self, key: &str) -> Option<NoteRow> {
		let row = self.notes.remove(key)?;
		self.key_by_remote.remove(&row.remote_id);
		Some(row)
	}

	pub fn upsert_deck(&mut self, row: DeckRow) {
		self.remove_deck(&row.path);
		if let Some(holder) = self.deck_by_remote.remove(&row.remote_id) {
			self.decks.remove(&holder);
		}
		self.deck_by_remote.insert(row.remote_id, row.path.clone());
		self.decks.insert(row.path, row.remote_id);
	}

	pub fn remove_deck(&mut self, path: &DeckPath) -> Option<i64> {
		let id = self.decks.remove(path)?;
		self.deck_by_remote.remove(&id);
		Some(id)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn row(key: &str, remote_id: i64) -> NoteRow {
		NoteRow {
			key: key.to_string(),
			remote_id,
			deck_remote_id: 1,
			content_hash: ContentHash::stored("abc".into()),
			deck_path: DeckPath::parse("Deck").unwrap(),
		}
	}

	#[test]
	fn upsert_keeps_bijection() {
		let mut state = MappingState::default();
		state.upsert_note(row("k1", 10));
		state.upsert_note(row("k2", 20));

		// k3 takes over remote id 10.
		let evicted = state.upsert_note(row("k3", 10));
		assert_eq!(evicted.len(), 1);
		assert_eq!(evicted[0].key, "k1");
		assert!(state.note("k1").is_none());
		assert_eq!(state.key_for_remote(10), Some("k3"));

		// k2 moves to a new remote id; the old id is released.
		state.upsert_note(row("k2", 30));
		assert_eq!(state.key_for_remote(20), None);
		assert_eq!(state.key_for_remote(30), Some("k2"));
		assert_eq!(state.note_count(), 2);
	}

	#[test]
	fn from_rows_rejects_duplicates() {
		assert!(MappingState::from_rows(vec![row("k", 1), row("k", 2)], vec![]).is_err());
		assert!(MappingState::from_rows(vec![row("a", 1), row("b", 1)], vec![]).is_err());

		let deck = |p: &str, id| DeckRow {
			path: DeckPath::parse(p).unwrap(),
			remote_id: id,
		};
		assert!(MappingState::from_rows(vec![], vec![deck("A", 1), deck("B", 1)]).is_err());
		assert!(MappingState::from_rows(vec![], vec![deck("A", 1), deck("B", 2)]).is_ok());
	}

	#[test]
	fn deck_upsert_replaces_renamed_path() {
		let mut state = MappingState::default();
		let biology = DeckPath::parse("Biology").unwrap();
		let advanced = DeckPath::parse("Biology::Advanced").unwrap();
		state.upsert_deck(DeckRow { path: biology.clone(), remote_id: 7 });
		state.upsert_deck(DeckRow { path: advanced.clone(), remote_id: 7 });
		assert_eq!(state.deck_id(&biology), None);
		assert_eq!(state.deck_path_for(7), Some(&advanced));
		assert_eq!(state.deck_count(), 1);
	}
}
