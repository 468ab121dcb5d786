use std::{
	collections::{BTreeMap, BTreeSet, HashSet},
	path::{Path, PathBuf},
	sync::Arc,
};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
	config::{Config, Scope},
	db::StoreError,
	engine::{
		applier::{Applier, ApplyReport, ApplyResult},
		conflict::{self, Conflict},
		drift::{self, Finding},
		mapping_store::{self, Loaded, MappingStore, RebuildReport},
		planner::{self, Plan},
		snapshot::{self, Snapshot, SnapshotIssue},
		CancelFlag,
	},
	files::{
		media::{MediaFolders, MediaReport},
		CollectionError, FileCollection,
	},
	models::{
		deck::DeckPath,
		mapping::{DeckRow, MappingDelta, MappingState, NoteRow},
		note_type::{NoteTypeError, NoteTypeRegistry},
		operation::{Direction, Operation, RecordOp},
		record::{Origin, Record},
	},
	remote::{NoteTypeChange, RemoteError, RemoteStore},
	transform::{HtmlText, TextTransform},
};

#[derive(Debug, Error)]
pub enum SyncError {
	#[error("duplicate key markers in deck files: {}", describe(.0))]
	DuplicateKey(Vec<Conflict>),

	#[error("mapping store is unreadable and no deck file carries a key marker ({reason}); refusing to duplicate every note")]
	StoreUnrecoverable { reason: String },

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Collection(#[from] CollectionError),

	#[error(transparent)]
	Remote(#[from] RemoteError),

	#[error(transparent)]
	NoteTypes(#[from] NoteTypeError),

	#[error("could not set up note type '{name}' in the collection: {source}")]
	NoteTypeSetup {
		name: String,
		#[source]
		source: RemoteError,
	},

	#[error("pass cancelled before any change was made")]
	Cancelled,

	#[error("background task failed: {0}")]
	Task(String),
}

fn describe(conflicts: &[Conflict]) -> String {
	conflicts.iter().map(|c| c.to_string()).collect::<Vec<_>>().join("; ")
}

/// What one pass saw, decided and did.
#[derive(Debug, Clone)]
pub struct PassReport {
	pub direction: Direction,
	pub started: DateTime<Utc>,
	pub finished: DateTime<Utc>,
	pub plan: Plan,
	pub findings: Vec<Finding>,
	pub issues: Vec<SnapshotIssue>,
	/// Entries in the collection directory that could not be read as deck files.
	pub skipped_files: u64,
	pub rebuild: Option<RebuildReport>,
	/// `None` when the plan was only computed.
	pub apply: Option<ApplyReport>,
	/// `None` when media was not synced this pass.
	pub media: Option<MediaReport>,
	pub rows_committed: usize,
}

impl PassReport {
	pub fn result(&self) -> ApplyResult {
		self.apply.as_ref().map_or(ApplyResult::Applied, ApplyReport::result)
	}

	pub fn has_failures(&self) -> bool {
		matches!(self.result(), ApplyResult::PartialFailure { .. })
	}

	/// One line for the terminal.
	pub fn headline(&self) -> String {
		let summary = self.plan.summary().format();
		match self.result() {
			ApplyResult::Applied if self.apply.is_some() => format!("{}: {summary}", self.direction),
			ApplyResult::Applied => format!("{} (plan only): {summary}", self.direction),
			ApplyResult::PartialFailure { failed, abandoned } => format!(
				"{}: {summary}; {} failed, {abandoned} not attempted",
				self.direction,
				failed.len()
			),
		}
	}
}

/// Runs sync passes for one collection directory.
pub struct SyncEngine<R: RemoteStore + 'static> {
	root: PathBuf,
	config: Config,
	registry: NoteTypeRegistry,
	remote: Arc<R>,
	store: MappingStore,
	transform: Arc<dyn TextTransform>,
	cancel: CancelFlag,
}

impl<R: RemoteStore + 'static> SyncEngine<R> {
	pub fn new(root: impl Into<PathBuf>, config: Config, remote: Arc<R>) -> Result<Self, SyncError> {
		let root = root.into();
		let registry = config.registry()?;
		let store = MappingStore::at(config.store_path(&root));
		Ok(SyncEngine {
			root,
			config,
			registry,
			remote,
			store,
			transform: Arc::new(HtmlText),
			cancel: CancelFlag::new(),
		})
	}

	pub fn with_store(mut self, store: MappingStore) -> Self {
		self.store = store;
		self
	}

	pub fn with_transform(mut self, transform: Arc<dyn TextTransform>) -> Self {
		self.transform = transform;
		self
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Flag that stops the running pass.
	pub fn cancel_flag(&self) -> CancelFlag {
		self.cancel.clone()
	}

	/// Rows the mapping store holds right now.
	pub async fn mapping(&mut self) -> Result<MappingState, SyncError> {
		match self.store.load(false).await? {
			Loaded::Ready(state) => Ok(state),
			Loaded::Corrupted { reason } => Err(StoreError::Query(reason).into()),
		}
	}

	/// Make the target side of `direction` match its canonical side.
	pub async fn run(&mut self, direction: Direction) -> Result<PassReport, SyncError> {
		self.pass(direction, true).await
	}

	/// Compute the plan without touching either side or the store.
	pub async fn plan_only(&mut self, direction: Direction) -> Result<PassReport, SyncError> {
		self.pass(direction, false).await
	}

	/// Import, then export. A failed import stops the round trip.
	pub async fn round_trip(&mut self) -> Result<Vec<PassReport>, SyncError> {
		let import = self.run(Direction::Import).await?;
		if import.has_failures() {
			tracing::warn!("import finished with failures; skipping export");
			return Ok(vec![import]);
		}
		let export = self.run(Direction::Export).await?;
		Ok(vec![import, export])
	}

	async fn pass(&mut self, direction: Direction, apply: bool) -> Result<PassReport, SyncError> {
		let started = Utc::now();
		if self.cancel.is_cancelled() {
			return Err(SyncError::Cancelled);
		}
		tracing::info!("{direction} pass started for {}", self.root.display());

		let mut media_folders = if apply { self.media_folders().await? } else { None };
		// Renames rewrite deck files, so pushing has to precede the snapshots.
		let mut media = None;
		if direction == Direction::Import {
			if let Some(folders) = media_folders.take() {
				media = Some(self.sync_media(folders, direction).await?);
			}
		}

		let (mut files, files_snap, remote_snap) = self.snapshots().await?;

		let duplicates: Vec<Conflict> = files_snap
			.duplicates
			.iter()
			.map(|(key, locations)| Conflict::DuplicateKey {
				key: key.clone(),
				locations: locations.clone(),
			})
			.collect();
		if !duplicates.is_empty() {
			for c in &duplicates {
				tracing::error!("conflict: {c}; {}", conflict::resolve(c, direction));
			}
			return Err(SyncError::DuplicateKey(duplicates));
		}

		let (mapping, rebuild) = self.load_mapping(&files_snap, &remote_snap, apply).await?;

		let drift = drift::classify(&files_snap, &remote_snap, &mapping);
		let (canonical, target) = match direction {
			Direction::Import => (&files_snap, &remote_snap),
			Direction::Export => (&remote_snap, &files_snap),
		};
		let plan = planner::plan(direction, canonical, target, &mapping, &drift);
		tracing::info!("{direction} plan: {}", plan.summary().format());
		for issue in &plan.issues {
			tracing::warn!("{issue}");
		}

		let skipped_files = files.skipped();
		if skipped_files > 0 {
			tracing::warn!("{skipped_files} entries in {} are not deck files", self.root.display());
		}
		let mut issues = files_snap.issues.clone();
		issues.extend(remote_snap.issues.iter().cloned());
		for issue in &issues {
			tracing::warn!("{issue}");
		}

		let mut report = PassReport {
			direction,
			started,
			finished: started,
			plan,
			findings: drift.findings,
			issues,
			skipped_files,
			rebuild,
			apply: None,
			media,
			rows_committed: 0,
		};
		if !apply {
			report.finished = Utc::now();
			return Ok(report);
		}
		if self.cancel.is_cancelled() {
			return Err(SyncError::Cancelled);
		}
		if direction == Direction::Import {
			self.ensure_note_types().await?;
		}

		let applier = Applier {
			remote: Arc::clone(&self.remote),
			registry: &self.registry,
			transform: self.transform.as_ref(),
			max_concurrency: self.config.remote.max_concurrency,
			timeout: self.config.remote.timeout(),
			cancel: self.cancel.clone(),
		};
		let outcome = applier.apply(&report.plan, &mut files, &remote_snap).await;

		let remote_decks = match direction {
			Direction::Import => self.remote_decks_after_apply(&remote_snap).await,
			Direction::Export => snapshot_decks(&remote_snap),
		};
		let file_decks: BTreeSet<DeckPath> = files.decks().cloned().collect();
		let delta = mapping_delta(
			&report.plan,
			&outcome,
			&mapping,
			&remote_decks,
			&file_decks,
			&self.config.scope,
		);
		self.store.commit(&delta).await?;
		report.rows_committed = delta.row_count();

		match outcome.result() {
			ApplyResult::Applied => tracing::info!("{direction} pass applied {} operations", outcome.outcomes.len()),
			ApplyResult::PartialFailure { failed, abandoned } => {
				for f in &failed {
					tracing::error!("{}: {}", f.op, f.cause);
				}
				tracing::warn!(
					"{direction} pass finished with {} failed and {abandoned} abandoned operations",
					failed.len()
				);
			}
		}
		report.apply = Some(outcome);

		if let Some(folders) = media_folders {
			match self.sync_media(folders, direction).await {
				Ok(pulled) => report.media = Some(pulled),
				Err(e) => tracing::error!("media pull failed: {e}"),
			}
		}
		report.finished = Utc::now();
		Ok(report)
	}

	/// Both media folders, or `None` when media sync is off or unavailable.
	async fn media_folders(&self) -> Result<Option<MediaFolders>, SyncError> {
		if !self.config.media.enabled {
			return Ok(None);
		}
		match self.remote.media_dir().await? {
			Some(dir) => Ok(Some(MediaFolders::new(&self.root, dir)?)),
			None => {
				tracing::debug!("collection has no reachable media folder; skipping media");
				Ok(None)
			}
		}
	}

	async fn sync_media(&self, folders: MediaFolders, direction: Direction) -> Result<MediaReport, SyncError> {
		let report = tokio::task::spawn_blocking(move || match direction {
			Direction::Import => folders.push(),
			Direction::Export => folders.pull(),
		})
		.await
		.map_err(|e| SyncError::Task(e.to_string()))??;
		tracing::info!("{direction} media: {}", report.format());
		Ok(report)
	}

	/// Declare every known note type in the collection before notes are created there.
	async fn ensure_note_types(&self) -> Result<(), SyncError> {
		let timeout = self.config.remote.timeout();
		for note_type in self.registry.types() {
			let name = note_type.name.clone();
			let change = match tokio::time::timeout(timeout, self.remote.ensure_note_type(note_type)).await {
				Ok(result) => result,
				Err(_) => Err(RemoteError::Timeout {
					action: "ensure note type".into(),
					secs: timeout.as_secs(),
				}),
			}
			.map_err(|source| SyncError::NoteTypeSetup {
				name: name.clone(),
				source,
			})?;
			match change {
				NoteTypeChange::Created => tracing::info!("created note type '{name}'"),
				NoteTypeChange::FieldsAdded(fields) => {
					tracing::info!("added fields {} to note type '{name}'", fields.join(", "))
				}
				NoteTypeChange::Unchanged => {}
			}
		}
		Ok(())
	}

	/// Both sides, read concurrently. The file walk runs on the blocking pool.
	async fn snapshots(&self) -> Result<(FileCollection, Snapshot, Snapshot), SyncError> {
		let root = self.root.clone();
		let scope = self.config.scope.clone();
		let registry = self.registry.clone();
		let file_side = tokio::task::spawn_blocking(move || {
			let files = FileCollection::load(&root, &scope)?;
			let snap = snapshot::build_file_snapshot(&files, &registry, &scope);
			Ok::<_, CollectionError>((files, snap))
		});
		let remote_side = snapshot::build_remote_snapshot(
			self.remote.as_ref(),
			&self.registry,
			self.transform.as_ref(),
			&self.config.scope,
		);

		let (file_side, remote_side) = tokio::join!(file_side, remote_side);
		let (files, files_snap) = file_side.map_err(|e| SyncError::Task(e.to_string()))??;
		Ok((files, files_snap, remote_side?))
	}

	async fn load_mapping(
		&mut self,
		files: &Snapshot,
		remote: &Snapshot,
		persist: bool,
	) -> Result<(MappingState, Option<RebuildReport>), SyncError> {
		let reason = match self.store.load(persist).await? {
			Loaded::Ready(state) => return Ok((state, None)),
			Loaded::Corrupted { reason } => reason,
		};
		tracing::warn!("mapping store unreadable: {reason}");

		let keyless = !files.records().is_empty() && files.records().iter().all(|r| r.key.is_none());
		if keyless && !remote.records().is_empty() {
			return Err(SyncError::StoreUnrecoverable { reason });
		}
		let (state, report) = if persist {
			self.store.rebuild_from_markers(files, remote).await?
		} else {
			mapping_store::reconstruct(files, remote)
		};
		Ok((state, Some(report)))
	}

	async fn remote_decks_after_apply(&self, before: &Snapshot) -> BTreeMap<DeckPath, i64> {
		match self.remote.list_decks().await {
			Ok(decks) => decks
				.into_iter()
				.filter(|d| self.config.scope.contains(&d.path))
				.map(|d| (d.path, d.id))
				.collect(),
			Err(e) => {
				tracing::warn!("could not list decks after applying: {e}");
				snapshot_decks(before)
			}
		}
	}
}

fn snapshot_decks(snapshot: &Snapshot) -> BTreeMap<DeckPath, i64> {
	snapshot
		.decks()
		.filter_map(|(path, id)| id.map(|id| (path.clone(), id)))
		.collect()
}

/// Row changes implied by what actually happened this pass.
fn mapping_delta(
	plan: &Plan,
	outcome: &ApplyReport,
	mapping: &MappingState,
	remote_decks: &BTreeMap<DeckPath, i64>,
	file_decks: &BTreeSet<DeckPath>,
	scope: &Scope,
) -> MappingDelta {
	let mut delta = MappingDelta::default();
	let import = plan.direction == Direction::Import;

	let mut removed: Vec<String> = plan.unbind.clone();
	let mut rows: BTreeMap<String, NoteRow> = BTreeMap::new();
	for binding in &plan.bindings {
		let Some(deck_remote_id) = remote_decks.get(&binding.deck).copied() else {
			continue;
		};
		rows.insert(
			binding.key.clone(),
			NoteRow {
				key: binding.key.clone(),
				remote_id: binding.remote_id,
				deck_remote_id,
				content_hash: binding.hash.clone(),
				deck_path: binding.deck.clone(),
			},
		);
	}
	let mut add = |key: &str, remote_id: i64, record: &Record| {
		let Some(deck_remote_id) = remote_decks.get(&record.deck).copied() else {
			tracing::warn!("no collection deck id for '{}'; '{key}' stays unmapped", record.deck);
			return;
		};
		rows.insert(
			key.to_string(),
			NoteRow {
				key: key.to_string(),
				remote_id,
				deck_remote_id,
				content_hash: record.hash.clone(),
				deck_path: record.deck.clone(),
			},
		);
	};

	for done in outcome.applied() {
		let Operation::Record(op) = &done.op else {
			continue;
		};
		match op {
			RecordOp::Create { record } => {
				let remote_id = if import { done.created_id } else { record.remote_id() };
				if let (Some(key), Some(id)) = (&record.key, remote_id) {
					add(key, id, record);
				}
			}
			RecordOp::Update { at, record, .. } | RecordOp::Move { at, record, .. } => {
				let remote_id = match (import, at.origin) {
					(true, Origin::Remote(id)) => Some(id),
					(true, Origin::File { .. }) => None,
					(false, _) => record.remote_id(),
				};
				if let (Some(key), Some(id)) = (&record.key, remote_id) {
					add(key, id, record);
				}
			}
			RecordOp::Delete { key: Some(key), .. } => removed.push(key.clone()),
			RecordOp::Delete { key: None, .. } => {}
		}
	}

	delta.upsert_notes = rows.into_values().filter(|row| mapping.note(&row.key) != Some(row)).collect();
	let upserted: HashSet<&str> = delta.upsert_notes.iter().map(|r| r.key.as_str()).collect();
	removed.retain(|key| !upserted.contains(key.as_str()) && mapping.note(key).is_some());
	removed.sort();
	removed.dedup();
	delta.remove_notes = removed;

	// Deck rows: every in-scope deck present on both sides.
	let present: BTreeMap<&DeckPath, i64> = remote_decks
		.iter()
		.filter(|(path, _)| file_decks.contains(*path) && scope.contains(path))
		.map(|(path, id)| (path, *id))
		.collect();
	for (path, id) in &present {
		if mapping.deck_id(path) != Some(*id) {
			delta.upsert_decks.push(DeckRow {
				path: (*path).clone(),
				remote_id: *id,
			});
		}
	}
	delta.remove_decks = mapping
		.decks()
		.filter(|row| scope.contains(&row.path) && !present.contains_key(&row.path))
		.map(|row| row.path)
		.collect();

	delta
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		engine::applier::{OpOutcome, OpStatus},
		models::{
			operation::Locator,
			record::{ContentHash, Fields},
		},
	};

	fn deck(name: &str) -> DeckPath {
		DeckPath::parse(name).unwrap()
	}

	fn qa(key: &str, deck_name: &str, origin: Origin) -> Record {
		let fields = Fields::from_pairs(vec![("Question".to_string(), "q".to_string())]);
		Record::new(Some(key.to_string()), "CardSyncQA", fields, deck(deck_name), origin)
	}

	fn outcome(op: Operation, status: OpStatus, created_id: Option<i64>) -> OpOutcome {
		OpOutcome { op, status, created_id }
	}

	#[test]
	fn delta_reflects_successful_operations_only() {
		let mut plan = Plan::new(Direction::Import);
		let created = Operation::Record(RecordOp::Create {
			record: qa("K1", "D", Origin::File { ordinal: 0 }),
		});
		let failed = Operation::Record(RecordOp::Create {
			record: qa("K2", "D", Origin::File { ordinal: 1 }),
		});
		let deleted = Operation::Record(RecordOp::Delete {
			key: Some("K3".into()),
			label: "K3".into(),
			at: Locator {
				deck: deck("D"),
				origin: Origin::Remote(30),
			},
		});
		plan.operations = vec![created.clone(), failed.clone(), deleted.clone()];
		let report = ApplyReport {
			outcomes: vec![
				outcome(created, OpStatus::Applied, Some(10)),
				outcome(failed, OpStatus::Abandoned, None),
				outcome(deleted, OpStatus::Applied, None),
			],
			stamp_failures: Vec::new(),
		};
		let mapping = MappingState::from_rows(
			vec![NoteRow {
				key: "K3".into(),
				remote_id: 30,
				deck_remote_id: 1,
				content_hash: ContentHash::stored("x".into()),
				deck_path: deck("D"),
			}],
			vec![DeckRow { path: deck("Gone"), remote_id: 2 }],
		)
		.unwrap();
		let remote_decks = BTreeMap::from([(deck("D"), 1)]);
		let file_decks = BTreeSet::from([deck("D")]);

		let delta = mapping_delta(&plan, &report, &mapping, &remote_decks, &file_decks, &Scope::default());

		assert_eq!(delta.upsert_notes.len(), 1);
		assert_eq!(delta.upsert_notes[0].key, "K1");
		assert_eq!(delta.upsert_notes[0].remote_id, 10);
		assert_eq!(delta.remove_notes, vec!["K3".to_string()]);
		assert_eq!(delta.upsert_decks, vec![DeckRow { path: deck("D"), remote_id: 1 }]);
		assert_eq!(delta.remove_decks, vec![deck("Gone")]);
	}

	#[test]
	fn unchanged_bindings_write_nothing() {
		let record = qa("K1", "D", Origin::Remote(10));
		let mut plan = Plan::new(Direction::Export);
		plan.bindings.push(planner::Binding {
			key: "K1".into(),
			remote_id: 10,
			deck: deck("D"),
			hash: record.hash.clone(),
		});
		let mapping = MappingState::from_rows(
			vec![NoteRow {
				key: "K1".into(),
				remote_id: 10,
				deck_remote_id: 1,
				content_hash: record.hash,
				deck_path: deck("D"),
			}],
			vec![DeckRow { path: deck("D"), remote_id: 1 }],
		)
		.unwrap();

		let delta = mapping_delta(
			&plan,
			&ApplyReport::default(),
			&mapping,
			&BTreeMap::from([(deck("D"), 1)]),
			&BTreeSet::from([deck("D")]),
			&Scope::default(),
		);

		assert!(delta.is_empty(), "{delta:?}");
	}
}
