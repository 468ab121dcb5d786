use std::{
	collections::{BTreeMap, BTreeSet, HashMap},
	fmt,
};

use crate::{
	config::Scope,
	files::{
		markdown::{self, ParsedBlock},
		FileCollection,
	},
	models::{
		deck::DeckPath,
		note_type::{Detection, NoteTypeRegistry, KEY_FIELD},
		operation::{Locator, Side},
		record::{Fields, Origin, Record},
	},
	remote::{RemoteError, RemoteStore},
	transform::TextTransform,
};

/// A record that could not be read. It is left out of the pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotIssue {
	pub side: Side,
	pub at: Locator,
	/// Key marker or first line.
	pub label: String,
	pub reason: String,
}

impl fmt::Display for SnapshotIssue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {} ({}): {}", self.side, self.label, self.at, self.reason)
	}
}

/// Read-only enumeration of one side at the start of a pass.
#[derive(Debug, Clone)]
pub struct Snapshot {
	pub side: Side,
	pub scope: Scope,
	records: Vec<Record>,
	by_key: HashMap<String, usize>,
	by_remote: HashMap<i64, usize>,
	decks: BTreeMap<DeckPath, Option<i64>>,
	/// Remote decks outside the scope; their rows are left alone.
	foreign_decks: BTreeSet<i64>,
	pub issues: Vec<SnapshotIssue>,
	/// Keys of records that were excluded as unreadable. Never deleted.
	pub excluded_keys: BTreeSet<String>,
	pub unmanaged: BTreeMap<DeckPath, usize>,
	/// Keys carried by more than one record.
	pub duplicates: BTreeMap<String, Vec<Locator>>,
}

impl Snapshot {
	pub fn new(side: Side, scope: Scope) -> Self {
		Snapshot {
			side,
			scope,
			records: Vec::new(),
			by_key: HashMap::new(),
			by_remote: HashMap::new(),
			decks: BTreeMap::new(),
			foreign_decks: BTreeSet::new(),
			issues: Vec::new(),
			excluded_keys: BTreeSet::new(),
			unmanaged: BTreeMap::new(),
			duplicates: BTreeMap::new(),
		}
	}

	pub fn add_deck(&mut self, path: DeckPath, remote_id: Option<i64>) {
		self.decks.insert(path, remote_id);
	}

	pub fn add_foreign_deck(&mut self, remote_id: i64) {
		self.foreign_decks.insert(remote_id);
	}

	pub fn add_record(&mut self, record: Record) {
		let index = self.records.len();
		if let Some(key) = &record.key {
			match self.by_key.get(key) {
				Some(&first) => {
					let first_at = locator(&self.records[first]);
					let entry = self.duplicates.entry(key.clone()).or_insert_with(|| vec![first_at]);
					entry.push(locator(&record));
				}
				None => {
					self.by_key.insert(key.clone(), index);
				}
			}
		}
		if let Some(id) = record.remote_id() {
			self.by_remote.insert(id, index);
		}
		self.decks.entry(record.deck.clone()).or_insert(None);
		self.records.push(record);
	}

	pub fn add_unmanaged(&mut self, deck: &DeckPath) {
		*self.unmanaged.entry(deck.clone()).or_insert(0) += 1;
	}

	pub fn add_issue(&mut self, at: Locator, key: Option<String>, label: String, reason: String) {
		if let Some(key) = key {
			self.excluded_keys.insert(key);
		}
		self.issues.push(SnapshotIssue {
			side: self.side,
			at,
			label,
			reason,
		});
	}

	pub fn records(&self) -> &[Record] {
		&self.records
	}

	/// First record carrying `key`.
	pub fn get(&self, key: &str) -> Option<&Record> {
		self.by_key.get(key).map(|&i| &self.records[i])
	}

	pub fn by_remote_id(&self, id: i64) -> Option<&Record> {
		self.by_remote.get(&id).map(|&i| &self.records[i])
	}

	pub fn decks(&self) -> impl Iterator<Item = (&DeckPath, Option<i64>)> {
		self.decks.iter().map(|(p, id)| (p, *id))
	}

	pub fn has_deck(&self, path: &DeckPath) -> bool {
		self.decks.contains_key(path)
	}

	pub fn deck_id(&self, path: &DeckPath) -> Option<i64> {
		self.decks.get(path).copied().flatten()
	}

	pub fn deck_path_for(&self, remote_id: i64) -> Option<&DeckPath> {
		self.decks
			.iter()
			.find(|(_, id)| **id == Some(remote_id))
			.map(|(p, _)| p)
	}

	pub fn is_foreign_deck(&self, remote_id: i64) -> bool {
		self.foreign_decks.contains(&remote_id)
	}

	pub fn unmanaged_in(&self, deck: &DeckPath) -> usize {
		self.unmanaged.get(deck).copied().unwrap_or(0)
	}

	/// Decks holding at least one managed record.
	pub fn decks_with_records(&self) -> BTreeSet<&DeckPath> {
		self.records.iter().map(|r| &r.deck).collect()
	}
}

fn locator(record: &Record) -> Locator {
	Locator {
		deck: record.deck.clone(),
		origin: record.origin,
	}
}

fn first_line(raw: &str) -> String {
	let line = raw
		.lines()
		.map(str::trim)
		.find(|l| !l.is_empty() && markdown::marker_key(l).is_none())
		.unwrap_or_default();
	let short: String = line.chars().take(40).collect();
	format!("'{short}'")
}

/// Classify every block of every loaded deck file.
pub fn build_file_snapshot(files: &FileCollection, registry: &NoteTypeRegistry, scope: &Scope) -> Snapshot {
	let mut snapshot = Snapshot::new(Side::Files, scope.clone());
	for deck in files.decks() {
		snapshot.add_deck(deck.clone(), None);
		for (ordinal, raw) in files.blocks(deck) {
			let at = Locator {
				deck: deck.clone(),
				origin: Origin::File { ordinal },
			};
			match markdown::parse_block(raw, registry) {
				ParsedBlock::Unmanaged => snapshot.add_unmanaged(deck),
				ParsedBlock::Invalid { key, reason } => {
					let label = key.clone().unwrap_or_else(|| first_line(raw));
					snapshot.add_issue(at, key, label, reason);
				}
				ParsedBlock::Note(note) => {
					let fields = Fields::from_pairs(note.fields);
					match registry.detect(&fields) {
						Detection::Managed(note_type) => {
							let fields = fields.normalized(note_type);
							snapshot.add_record(Record::new(
								note.key,
								&note_type.name,
								fields,
								deck.clone(),
								Origin::File { ordinal },
							));
						}
						Detection::Malformed { note_type, errors } => {
							let label = note.key.clone().unwrap_or_else(|| first_line(raw));
							let reason = format!("not a valid {}: {}", note_type.name, errors.join("; "));
							snapshot.add_issue(at, note.key, label, reason);
						}
						Detection::Unmanaged => {
							// A keyed block that no longer fits a type is still protected.
							if let Some(key) = note.key {
								snapshot.excluded_keys.insert(key);
							}
							snapshot.add_unmanaged(deck);
						}
					}
				}
			}
		}
	}
	tracing::debug!(
		"file snapshot: {} records, {} issues, {} unmanaged",
		snapshot.records.len(),
		snapshot.issues.len(),
		snapshot.unmanaged.values().sum::<usize>()
	);
	snapshot
}

/// Read every in-scope deck of the collection. Notes of unknown types are counted, not read.
pub async fn build_remote_snapshot<R: RemoteStore + ?Sized>(
	remote: &R,
	registry: &NoteTypeRegistry,
	transform: &dyn TextTransform,
	scope: &Scope,
) -> Result<Snapshot, RemoteError> {
	let mut snapshot = Snapshot::new(Side::Remote, scope.clone());
	let decks = remote.list_decks().await?;
	for deck in decks {
		if !scope.contains(&deck.path) {
			snapshot.add_foreign_deck(deck.id);
			continue;
		}
		snapshot.add_deck(deck.path.clone(), Some(deck.id));
		for note in remote.list_records_in_deck(&deck).await? {
			let Some(note_type) = registry.get(&note.note_type) else {
				snapshot.add_unmanaged(&deck.path);
				continue;
			};
			let key = note.embedded_key().map(str::to_string);
			let fields = Fields::from_pairs(
				note.fields
					.iter()
					.filter(|(name, _)| name != KEY_FIELD)
					.map(|(name, value)| (name.clone(), transform.parse(value))),
			)
			.normalized(note_type);
			snapshot.add_record(Record::new(
				key,
				&note_type.name,
				fields,
				deck.path.clone(),
				Origin::Remote(note.id),
			));
		}
	}
	tracing::debug!(
		"remote snapshot: {} records in {} decks, {} unmanaged",
		snapshot.records.len(),
		snapshot.decks.len(),
		snapshot.unmanaged.values().sum::<usize>()
	);
	Ok(snapshot)
}

#[cfg(test)]
mod tests {
	use std::fs;

	use super::*;
	use crate::{remote::MemoryRemote, transform::HtmlText};

	fn deck(name: &str) -> DeckPath {
		DeckPath::parse(name).unwrap()
	}

	fn file_snapshot(files: &[(&str, &str)]) -> Snapshot {
		let tmp = tempfile::tempdir().unwrap();
		for (name, text) in files {
			fs::write(tmp.path().join(name), text).unwrap();
		}
		let collection = FileCollection::load(tmp.path(), &Scope::default()).unwrap();
		build_file_snapshot(&collection, &NoteTypeRegistry::default(), &Scope::default())
	}

	#[test]
	fn file_blocks_are_classified() {
		let text = "<!-- note_key: K1 -->\nQ: one\nA: 1\n\n---\n\n\
		            just some notes\n\n---\n\n\
		            <!-- note_key: K2 -->\nT: no cloze here\n\n---\n\n\
		            Q: dup\nQ: again\nA: x";
		let snap = file_snapshot(&[("Deck.md", text)]);

		assert_eq!(snap.records().len(), 1);
		assert_eq!(snap.get("K1").unwrap().origin, Origin::File { ordinal: 0 });
		assert_eq!(snap.unmanaged_in(&deck("Deck")), 1);
		assert_eq!(snap.issues.len(), 2);
		assert!(snap.excluded_keys.contains("K2"));
		assert_eq!(snap.issues[1].label, "'Q: dup'");
	}

	#[test]
	fn duplicate_file_keys_are_reported() {
		let snap = file_snapshot(&[
			("A.md", "<!-- note_key: K -->\nQ: a\nA: a"),
			("B.md", "<!-- note_key: K -->\nQ: b\nA: b"),
		]);
		let locations = &snap.duplicates["K"];
		assert_eq!(locations.len(), 2);
		assert_eq!(locations[0].deck, deck("A"));
		assert_eq!(locations[1].deck, deck("B"));
	}

	#[test]
	fn empty_deck_file_is_still_a_deck() {
		let snap = file_snapshot(&[("Empty.md", "")]);
		assert!(snap.has_deck(&deck("Empty")));
		assert!(snap.records().is_empty());
	}

	#[tokio::test]
	async fn remote_snapshot_parses_rich_text_and_skips_foreign_types() {
		let remote = MemoryRemote::new();
		let id = remote
			.add_note(
				"Biology",
				"CardSyncQA",
				&[("Question", "a &lt; b<br>c"), ("Answer", "yes"), (KEY_FIELD, "K1")],
			)
			.unwrap();
		remote.add_note("Biology", "Basic", &[("Front", "x")]).unwrap();
		remote.add_note("Default", "CardSyncQA", &[("Question", "q"), ("Answer", "a")]).unwrap();

		let snap = build_remote_snapshot(&remote, &NoteTypeRegistry::default(), &HtmlText, &Scope::default())
			.await
			.unwrap();

		let record = snap.get("K1").unwrap();
		assert_eq!(record.remote_id(), Some(id));
		assert_eq!(record.fields.get("Question"), Some("a < b\nc"));
		assert_eq!(record.fields.get(KEY_FIELD), None);
		assert_eq!(snap.records().len(), 1);
		assert_eq!(snap.unmanaged_in(&deck("Biology")), 1);
		assert!(!snap.has_deck(&deck("Default")));
		assert!(snap.is_foreign_deck(remote.deck_id("Default").unwrap()));
	}
}
