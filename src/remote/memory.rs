use std::{
	collections::{btree_map::Entry, BTreeMap},
	path::PathBuf,
	sync::{Arc, Mutex, MutexGuard},
	time::Duration,
};

use async_trait::async_trait;

use crate::{
	models::{
		deck::{DeckNameError, DeckPath},
		note_type::NoteType,
	},
	remote::{NewRemoteRecord, NoteTypeChange, RemoteDeck, RemoteError, RemoteRecord, RemoteStore},
};

const FIRST_ID: i64 = 1000;

/// Which capability call a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
	ListDecks,
	ListRecords,
	CreateRecord,
	UpdateRecord,
	MoveRecord,
	DeleteRecord,
	CreateDeck,
	RenameDeck,
	DeleteDeck,
	EnsureNoteType,
}

#[derive(Debug, Clone)]
struct Fault {
	action: Action,
	/// Only calls whose subject contains this text fail.
	matching: Option<String>,
	remaining: usize,
	error: RemoteError,
}

#[derive(Debug, Clone)]
struct StoredNote {
	note_type: String,
	fields: Vec<(String, String)>,
	deck: i64,
}

#[derive(Debug, Default)]
struct Inner {
	next_id: i64,
	decks: BTreeMap<i64, DeckPath>,
	notes: BTreeMap<i64, StoredNote>,
	/// Model name to field names, in order.
	note_types: BTreeMap<String, Vec<String>>,
	/// Reject notes whose model was never declared.
	strict_note_types: bool,
	media_dir: Option<PathBuf>,
	faults: Vec<Fault>,
	latency: Option<Duration>,
	in_flight: usize,
	peak_in_flight: usize,
	mutations: usize,
}

impl Inner {
	fn allocate(&mut self) -> i64 {
		if self.next_id < FIRST_ID {
			self.next_id = FIRST_ID;
		}
		let id = self.next_id;
		self.next_id += 1;
		id
	}

	fn deck_id(&self, path: &DeckPath) -> Option<i64> {
		self.decks.iter().find(|(_, p)| *p == path).map(|(id, _)| *id)
	}

	fn ensure_deck(&mut self, path: &DeckPath) -> i64 {
		if let Some(parent) = path.parent() {
			self.ensure_deck(&parent);
		}
		match self.deck_id(path) {
			Some(id) => id,
			None => {
				let id = self.allocate();
				self.decks.insert(id, path.clone());
				id
			}
		}
	}

	fn check_fault(&mut self, action: Action, subject: &str) -> Result<(), RemoteError> {
		let hit = self.faults.iter_mut().find(|f| {
			f.action == action && f.remaining > 0 && f.matching.as_ref().is_none_or(|m| subject.contains(m.as_str()))
		});
		match hit {
			Some(fault) => {
				fault.remaining -= 1;
				Err(fault.error.clone())
			}
			None => Ok(()),
		}
	}

	fn record(&self, id: i64, note: &StoredNote) -> Option<RemoteRecord> {
		Some(RemoteRecord {
			id,
			note_type: note.note_type.clone(),
			fields: note.fields.clone(),
			deck: self.decks.get(&note.deck)?.clone(),
		})
	}
}

/// In-process collection with failure injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
	inner: Arc<Mutex<Inner>>,
}

impl MemoryRemote {
	pub fn new() -> Self {
		MemoryRemote::default()
	}

	fn lock(&self) -> MutexGuard<'_, Inner> {
		// A panicked test thread must not hide the collection from the others.
		self.inner.lock().unwrap_or_else(|e| e.into_inner())
	}

	async fn enter(&self, action: Action, subject: &str) -> Result<(), RemoteError> {
		let latency = {
			let mut inner = self.lock();
			inner.in_flight += 1;
			inner.peak_in_flight = inner.peak_in_flight.max(inner.in_flight);
			inner.latency
		};
		let leave = InFlight(self);
		if let Some(delay) = latency {
			tokio::time::sleep(delay).await;
		}
		let outcome = self.lock().check_fault(action, subject);
		drop(leave);
		outcome
	}

	/// Create a deck directly, as a user would in the application.
	pub fn add_deck(&self, name: &str) -> Result<i64, DeckNameError> {
		let path = DeckPath::parse(name)?;
		Ok(self.lock().ensure_deck(&path))
	}

	pub fn add_note(&self, deck: &str, note_type: &str, fields: &[(&str, &str)]) -> Result<i64, DeckNameError> {
		let deck = self.add_deck(deck)?;
		let mut inner = self.lock();
		let id = inner.allocate();
		inner.notes.insert(
			id,
			StoredNote {
				note_type: note_type.to_string(),
				fields: fields.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect(),
				deck,
			},
		);
		Ok(id)
	}

	/// Edit one field directly.
	pub fn set_field(&self, id: i64, name: &str, value: &str) {
		let mut inner = self.lock();
		if let Some(note) = inner.notes.get_mut(&id) {
			match note.fields.iter_mut().find(|(n, _)| n == name) {
				Some(slot) => slot.1 = value.to_string(),
				None => note.fields.push((name.to_string(), value.to_string())),
			}
		}
	}

	/// Rename a deck directly, keeping ids the way the application does.
	pub fn rename_deck_directly(&self, from: &str, to: &str) -> Result<(), DeckNameError> {
		let from = DeckPath::parse(from)?;
		let to = DeckPath::parse(to)?;
		self.lock().rename(&from, &to);
		Ok(())
	}

	/// Remove a note directly.
	pub fn remove_note(&self, id: i64) {
		self.lock().notes.remove(&id);
	}

	pub fn note(&self, id: i64) -> Option<RemoteRecord> {
		let inner = self.lock();
		inner.notes.get(&id).and_then(|n| inner.record(id, n))
	}

	pub fn notes(&self) -> Vec<RemoteRecord> {
		let inner = self.lock();
		inner.notes.iter().filter_map(|(id, n)| inner.record(*id, n)).collect()
	}

	pub fn deck_names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.lock().decks.values().map(|p| p.name()).collect();
		names.sort();
		names
	}

	pub fn deck_id(&self, name: &str) -> Option<i64> {
		let path = DeckPath::parse(name).ok()?;
		self.lock().deck_id(&path)
	}

	/// Number of successful mutating calls made through the capability.
	pub fn mutations(&self) -> usize {
		self.lock().mutations
	}

	/// Fail the next `times` calls of `action` whose subject contains `matching`.
	pub fn fail_next(&self, action: Action, matching: Option<&str>, times: usize, error: RemoteError) {
		self.lock().faults.push(Fault {
			action,
			matching: matching.map(str::to_string),
			remaining: times,
			error,
		});
	}

	pub fn set_latency(&self, latency: Option<Duration>) {
		self.lock().latency = latency;
	}

	/// Most capability calls that were ever in progress at once.
	pub fn peak_in_flight(&self) -> usize {
		self.lock().peak_in_flight
	}

	/// Refuse notes of undeclared models, as the application does.
	pub fn require_note_types(&self) {
		self.lock().strict_note_types = true;
	}

	/// Media folder reported to passes; none by default.
	pub fn set_media_dir(&self, dir: Option<PathBuf>) {
		self.lock().media_dir = dir;
	}

	pub fn note_type_fields(&self, name: &str) -> Option<Vec<String>> {
		self.lock().note_types.get(name).cloned()
	}
}

/// Leaves the in-flight count when dropped, also on cancellation.
struct InFlight<'r>(&'r MemoryRemote);

impl Drop for InFlight<'_> {
	fn drop(&mut self) {
		let mut inner = self.0.lock();
		inner.in_flight = inner.in_flight.saturating_sub(1);
	}
}

impl Inner {
	fn rename(&mut self, from: &DeckPath, to: &DeckPath) -> Option<i64> {
		let moving: Vec<(i64, DeckPath)> = self
			.decks
			.iter()
			.filter(|(_, p)| p.starts_with(from))
			.map(|(id, p)| (*id, p.clone()))
			.collect();
		let top = moving.iter().find(|(_, p)| p == from).map(|(id, _)| *id)?;
		for (id, path) in moving {
			if let Some(new) = path.rebase(from, to) {
				self.decks.insert(id, new);
			}
		}
		if let Some(parent) = to.parent() {
			self.ensure_deck(&parent);
		}
		Some(top)
	}
}

#[async_trait]
impl RemoteStore for MemoryRemote {
	async fn list_decks(&self) -> Result<Vec<RemoteDeck>, RemoteError> {
		self.enter(Action::ListDecks, "").await?;
		let inner = self.lock();
		Ok(inner
			.decks
			.iter()
			.map(|(id, path)| RemoteDeck {
				id: *id,
				path: path.clone(),
			})
			.collect())
	}

	async fn list_records_in_deck(&self, deck: &RemoteDeck) -> Result<Vec<RemoteRecord>, RemoteError> {
		self.enter(Action::ListRecords, &deck.path.name()).await?;
		let inner = self.lock();
		if !inner.decks.contains_key(&deck.id) {
			return Err(RemoteError::NotFound(format!("deck '{}'", deck.path)));
		}
		Ok(inner
			.notes
			.iter()
			.filter(|(_, n)| n.deck == deck.id)
			.filter_map(|(id, n)| inner.record(*id, n))
			.collect())
	}

	async fn create_record(&self, record: NewRemoteRecord) -> Result<i64, RemoteError> {
		let subject = record.fields.iter().map(|(_, v)| v.as_str()).collect::<Vec<_>>().join(" ");
		self.enter(Action::CreateRecord, &subject).await?;
		let mut inner = self.lock();
		if !inner.decks.contains_key(&record.deck.id) {
			return Err(RemoteError::NotFound(format!("deck '{}'", record.deck.path)));
		}
		if inner.strict_note_types && !inner.note_types.contains_key(&record.note_type) {
			return Err(RemoteError::Rejected {
				action: "addNote".into(),
				reason: format!("model was not found: {}", record.note_type),
			});
		}
		let id = inner.allocate();
		inner.notes.insert(
			id,
			StoredNote {
				note_type: record.note_type,
				fields: record.fields,
				deck: record.deck.id,
			},
		);
		inner.mutations += 1;
		Ok(id)
	}

	async fn update_record_fields(&self, id: i64, fields: Vec<(String, String)>) -> Result<(), RemoteError> {
		self.enter(Action::UpdateRecord, &id.to_string()).await?;
		let mut inner = self.lock();
		let note = inner
			.notes
			.get_mut(&id)
			.ok_or_else(|| RemoteError::NotFound(format!("note {id}")))?;
		for (name, value) in fields {
			match note.fields.iter_mut().find(|(n, _)| *n == name) {
				Some(slot) => slot.1 = value,
				None => note.fields.push((name, value)),
			}
		}
		inner.mutations += 1;
		Ok(())
	}

	async fn move_record(&self, id: i64, deck: &RemoteDeck) -> Result<(), RemoteError> {
		self.enter(Action::MoveRecord, &id.to_string()).await?;
		let mut inner = self.lock();
		if !inner.decks.contains_key(&deck.id) {
			return Err(RemoteError::NotFound(format!("deck '{}'", deck.path)));
		}
		let note = inner
			.notes
			.get_mut(&id)
			.ok_or_else(|| RemoteError::NotFound(format!("note {id}")))?;
		note.deck = deck.id;
		inner.mutations += 1;
		Ok(())
	}

	async fn delete_record(&self, id: i64) -> Result<(), RemoteError> {
		self.enter(Action::DeleteRecord, &id.to_string()).await?;
		let mut inner = self.lock();
		inner
			.notes
			.remove(&id)
			.ok_or_else(|| RemoteError::NotFound(format!("note {id}")))?;
		inner.mutations += 1;
		Ok(())
	}

	async fn create_deck(&self, path: &DeckPath) -> Result<i64, RemoteError> {
		self.enter(Action::CreateDeck, &path.name()).await?;
		let mut inner = self.lock();
		let id = inner.ensure_deck(path);
		inner.mutations += 1;
		Ok(id)
	}

	async fn rename_deck(&self, id: i64, to: &DeckPath) -> Result<i64, RemoteError> {
		self.enter(Action::RenameDeck, &to.name()).await?;
		let mut inner = self.lock();
		let from = inner
			.decks
			.get(&id)
			.cloned()
			.ok_or_else(|| RemoteError::NotFound(format!("deck {id}")))?;
		if inner.deck_id(to).is_some() {
			return Err(RemoteError::Rejected {
				action: "renameDeck".into(),
				reason: format!("deck '{to}' already exists"),
			});
		}
		let top = inner
			.rename(&from, to)
			.ok_or_else(|| RemoteError::NotFound(format!("deck '{from}'")))?;
		inner.mutations += 1;
		Ok(top)
	}

	async fn delete_deck(&self, deck: &RemoteDeck) -> Result<(), RemoteError> {
		self.enter(Action::DeleteDeck, &deck.path.name()).await?;
		let mut inner = self.lock();
		let path = inner
			.decks
			.get(&deck.id)
			.cloned()
			.ok_or_else(|| RemoteError::NotFound(format!("deck '{}'", deck.path)))?;
		let doomed: Vec<i64> = inner
			.decks
			.iter()
			.filter(|(_, p)| p.starts_with(&path))
			.map(|(id, _)| *id)
			.collect();
		inner.notes.retain(|_, n| !doomed.contains(&n.deck));
		inner.decks.retain(|id, _| !doomed.contains(id));
		inner.mutations += 1;
		Ok(())
	}

	async fn ensure_note_type(&self, note_type: &NoteType) -> Result<NoteTypeChange, RemoteError> {
		self.enter(Action::EnsureNoteType, &note_type.name).await?;
		let wanted: Vec<String> = note_type.collection_fields().into_iter().map(str::to_string).collect();
		let mut inner = self.lock();
		let change = match inner.note_types.entry(note_type.name.clone()) {
			Entry::Vacant(slot) => {
				slot.insert(wanted);
				NoteTypeChange::Created
			}
			Entry::Occupied(mut slot) => {
				let present = slot.get_mut();
				let missing: Vec<String> = wanted.into_iter().filter(|f| !present.contains(f)).collect();
				if missing.is_empty() {
					return Ok(NoteTypeChange::Unchanged);
				}
				present.extend(missing.iter().cloned());
				NoteTypeChange::FieldsAdded(missing)
			}
		};
		inner.mutations += 1;
		Ok(change)
	}

	async fn media_dir(&self) -> Result<Option<PathBuf>, RemoteError> {
		Ok(self.lock().media_dir.clone())
	}
}
