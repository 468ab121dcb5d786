use std::{
	collections::{BTreeSet, HashMap, HashSet},
	sync::Arc,
	time::Duration,
};

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::{
	engine::{
		planner::{Plan, Stamp},
		snapshot::Snapshot,
		CancelFlag,
	},
	files::{
		markdown::{self, ParsedBlock},
		CollectionError, FileCollection,
	},
	models::{
		deck::DeckPath,
		note_type::{NoteTypeRegistry, KEY_FIELD},
		operation::{DeckOp, Locator, Operation, RecordOp, Side},
		record::{Origin, Record},
	},
	remote::{NewRemoteRecord, RemoteDeck, RemoteError, RemoteStore},
	transform::TextTransform,
};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum OpError {
	#[error(transparent)]
	Remote(#[from] RemoteError),

	#[error("{0}")]
	Files(String),

	#[error("not attempted: {0}")]
	Dependency(String),

	#[error("task failed: {0}")]
	Task(String),
}

impl From<CollectionError> for OpError {
	fn from(err: CollectionError) -> Self {
		OpError::Files(err.to_string())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpStatus {
	Applied,
	Failed(OpError),
	/// Not dispatched because the pass was cancelled.
	Abandoned,
}

#[derive(Debug, Clone)]
pub struct OpOutcome {
	pub op: Operation,
	pub status: OpStatus,
	/// Id of a note created on the collection.
	pub created_id: Option<i64>,
}

impl OpOutcome {
	pub fn is_applied(&self) -> bool {
		self.status == OpStatus::Applied
	}
}

#[derive(Debug, Clone)]
pub struct FailedOp {
	pub op: Operation,
	pub cause: OpError,
}

#[derive(Debug, Clone)]
pub enum ApplyResult {
	Applied,
	PartialFailure { failed: Vec<FailedOp>, abandoned: usize },
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
	/// One per planned operation, in plan order.
	pub outcomes: Vec<OpOutcome>,
	pub stamp_failures: Vec<(Stamp, OpError)>,
}

impl ApplyReport {
	pub fn result(&self) -> ApplyResult {
		let failed: Vec<FailedOp> = self
			.outcomes
			.iter()
			.filter_map(|o| match &o.status {
				OpStatus::Failed(cause) => Some(FailedOp {
					op: o.op.clone(),
					cause: cause.clone(),
				}),
				_ => None,
			})
			.collect();
		let abandoned = self.outcomes.iter().filter(|o| o.status == OpStatus::Abandoned).count();
		if failed.is_empty() && abandoned == 0 && self.stamp_failures.is_empty() {
			ApplyResult::Applied
		} else {
			ApplyResult::PartialFailure { failed, abandoned }
		}
	}

	pub fn applied(&self) -> impl Iterator<Item = &OpOutcome> {
		self.outcomes.iter().filter(|o| o.is_applied())
	}

	pub fn failed_count(&self) -> usize {
		self.outcomes.iter().filter(|o| matches!(o.status, OpStatus::Failed(_))).count()
	}
}

/// Owned description of one collection call, so it can move into a task.
#[derive(Debug, Clone)]
enum RemoteJob {
	CreateDeck(DeckPath),
	RenameDeck { id: i64, to: DeckPath },
	DeleteDeck(RemoteDeck),
	Create(NewRemoteRecord),
	Update {
		id: i64,
		fields: Vec<(String, String)>,
		move_to: Option<RemoteDeck>,
	},
	Move { id: i64, deck: RemoteDeck },
	Delete { id: i64 },
	Stamp { id: i64, key: String },
}

impl RemoteJob {
	fn action(&self) -> &'static str {
		match self {
			RemoteJob::CreateDeck(_) => "createDeck",
			RemoteJob::RenameDeck { .. } => "renameDeck",
			RemoteJob::DeleteDeck(_) => "deleteDecks",
			RemoteJob::Create(_) => "addNote",
			RemoteJob::Update { .. } | RemoteJob::Stamp { .. } => "updateNoteFields",
			RemoteJob::Move { .. } => "changeDeck",
			RemoteJob::Delete { .. } => "deleteNotes",
		}
	}
}

async fn execute<R: RemoteStore + ?Sized>(remote: &R, job: &RemoteJob) -> Result<Option<i64>, RemoteError> {
	match job {
		RemoteJob::CreateDeck(path) => remote.create_deck(path).await.map(Some),
		RemoteJob::RenameDeck { id, to } => remote.rename_deck(*id, to).await.map(Some),
		RemoteJob::DeleteDeck(deck) => remote.delete_deck(deck).await.map(|_| None),
		RemoteJob::Create(record) => remote.create_record(record.clone()).await.map(Some),
		RemoteJob::Update { id, fields, move_to } => {
			remote.update_record_fields(*id, fields.clone()).await?;
			if let Some(deck) = move_to {
				remote.move_record(*id, deck).await?;
			}
			Ok(None)
		}
		RemoteJob::Move { id, deck } => remote.move_record(*id, deck).await.map(|_| None),
		RemoteJob::Delete { id } => remote.delete_record(*id).await.map(|_| None),
		RemoteJob::Stamp { id, key } => remote.stamp_key(*id, key).await.map(|_| None),
	}
}

/// One call with a deadline; retryable failures get a second attempt.
async fn call_with_retry<R: RemoteStore + ?Sized>(
	remote: &R,
	job: &RemoteJob,
	timeout: Duration,
) -> Result<Option<i64>, RemoteError> {
	let mut attempt = 1;
	loop {
		let result = match tokio::time::timeout(timeout, execute(remote, job)).await {
			Ok(result) => result,
			Err(_) => Err(RemoteError::Timeout {
				action: job.action().to_string(),
				secs: timeout.as_secs(),
			}),
		};
		match result {
			Err(e) if e.is_retryable() && attempt == 1 => {
				tracing::warn!("{} failed, retrying: {e}", job.action());
				attempt += 1;
			}
			other => return other,
		}
	}
}

/// Carries a plan out against the target side.
pub struct Applier<'a, R: RemoteStore + 'static> {
	pub remote: Arc<R>,
	pub registry: &'a NoteTypeRegistry,
	pub transform: &'a dyn TextTransform,
	pub max_concurrency: usize,
	pub timeout: Duration,
	pub cancel: CancelFlag,
}

/// Per-operation bookkeeping while a plan runs.
struct Progress {
	ops: Vec<Operation>,
	status: Vec<Option<OpStatus>>,
	created: Vec<Option<i64>>,
	failed_decks: BTreeSet<DeckPath>,
	failed_stamp_keys: HashSet<String>,
}

impl Progress {
	fn new(plan: &Plan) -> Self {
		let n = plan.operations.len();
		Progress {
			ops: plan.operations.clone(),
			status: vec![None; n],
			created: vec![None; n],
			failed_decks: BTreeSet::new(),
			failed_stamp_keys: HashSet::new(),
		}
	}

	fn record(&mut self, index: usize, result: Option<Result<Option<i64>, OpError>>) {
		let status = match result {
			None => OpStatus::Abandoned,
			Some(Ok(id)) => {
				self.created[index] = id;
				OpStatus::Applied
			}
			Some(Err(e)) => {
				tracing::error!("{} failed: {e}", self.ops[index]);
				if let Operation::Deck(op) = &self.ops[index] {
					self.failed_decks.insert(op.path().clone());
				}
				OpStatus::Failed(e)
			}
		};
		self.status[index] = Some(status);
	}

	/// Reason a record operation cannot run, given earlier failures.
	fn blocked(&self, op: &RecordOp) -> Option<OpError> {
		if let Some(key) = op.key() {
			if matches!(op, RecordOp::Create { .. }) && self.failed_stamp_keys.contains(key) {
				return Some(OpError::Dependency(format!("key marker for '{key}' could not be written")));
			}
		}
		let deck = op.destination_deck()?;
		self.failed_decks
			.iter()
			.find(|f| deck.starts_with(f))
			.map(|f| OpError::Dependency(format!("deck '{f}' could not be prepared")))
	}

	/// Reason a deck cannot be deleted: records meant to leave it are still there.
	fn deck_delete_blocked(&self, path: &DeckPath) -> Option<OpError> {
		let left_behind = self.ops.iter().zip(&self.status).any(|(op, status)| {
			let unfinished = !matches!(status, Some(OpStatus::Applied));
			match op {
				Operation::Record(r) => unfinished && r.source_deck().is_some_and(|d| d.starts_with(path)),
				Operation::Deck(DeckOp::Delete { path: child, .. }) => {
					child.is_descendant_of(path) && matches!(status, Some(OpStatus::Failed(_)) | Some(OpStatus::Abandoned))
				}
				Operation::Deck(_) => false,
			}
		});
		left_behind.then(|| OpError::Dependency(format!("deck '{path}' still holds records")))
	}

	fn finish(self, stamp_failures: Vec<(Stamp, OpError)>) -> ApplyReport {
		let outcomes = self
			.ops
			.into_iter()
			.zip(self.status)
			.zip(self.created)
			.map(|((op, status), created_id)| OpOutcome {
				op,
				status: status.unwrap_or(OpStatus::Abandoned),
				created_id,
			})
			.collect();
		ApplyReport {
			outcomes,
			stamp_failures,
		}
	}
}

fn remote_id(at: &Locator) -> Result<i64, OpError> {
	match at.origin {
		Origin::Remote(id) => Ok(id),
		Origin::File { .. } => Err(OpError::Task(format!("{at} is not a collection note"))),
	}
}

fn ordinal(at: &Locator) -> Result<usize, OpError> {
	match at.origin {
		Origin::File { ordinal } => Ok(ordinal),
		Origin::Remote(_) => Err(OpError::Task(format!("{at} is not a file block"))),
	}
}

impl<'a, R: RemoteStore + 'static> Applier<'a, R> {
	/// Run the plan phase by phase. `remote` is the collection snapshot the plan was made from.
	pub async fn apply(&self, plan: &Plan, files: &mut FileCollection, remote: &Snapshot) -> ApplyReport {
		let mut progress = Progress::new(plan);
		let stamp_failures = self.apply_stamps(plan, files).await;
		progress.failed_stamp_keys = stamp_failures.iter().map(|(s, _)| s.key().to_string()).collect();

		if self.cancel.is_cancelled() {
			tracing::warn!("pass cancelled before applying {} operations", plan.operations.len());
			return progress.finish(stamp_failures);
		}
		match plan.direction.target() {
			Side::Remote => self.apply_remote(&mut progress, remote).await,
			Side::Files => self.apply_files(&mut progress, files),
		}
		progress.finish(stamp_failures)
	}

	async fn apply_stamps(&self, plan: &Plan, files: &mut FileCollection) -> Vec<(Stamp, OpError)> {
		let mut failures = Vec::new();

		let mut file_stamps = Vec::new();
		for stamp in &plan.stamps {
			if let Stamp::File { deck, ordinal, key } = stamp {
				match files.stamp_key(deck, *ordinal, key) {
					Ok(()) => file_stamps.push(stamp),
					Err(e) => failures.push((stamp.clone(), OpError::from(e))),
				}
			}
		}
		if !file_stamps.is_empty() {
			for (deck, err) in files.flush() {
				let cause = OpError::from(err);
				for stamp in file_stamps.iter().filter(|s| matches!(s, Stamp::File { deck: d, .. } if *d == deck)) {
					failures.push(((*stamp).clone(), cause.clone()));
				}
			}
		}

		let remote_stamps: Vec<(usize, RemoteJob)> = plan
			.stamps
			.iter()
			.enumerate()
			.filter_map(|(i, s)| match s {
				Stamp::Remote { remote_id, key } => Some((
					i,
					RemoteJob::Stamp {
						id: *remote_id,
						key: key.clone(),
					},
				)),
				Stamp::File { .. } => None,
			})
			.collect();
		for (index, result) in self.run_batch(remote_stamps).await {
			let cause = match result {
				Some(Ok(_)) => continue,
				Some(Err(e)) => e,
				None => OpError::Dependency("pass cancelled".into()),
			};
			tracing::error!("{} failed: {cause}", plan.stamps[index]);
			failures.push((plan.stamps[index].clone(), cause));
		}
		failures
	}

	/// Dispatch collection calls with at most `max_concurrency` in flight.
	/// `None` marks a job that was never started.
	async fn run_batch(&self, jobs: Vec<(usize, RemoteJob)>) -> Vec<(usize, Option<Result<Option<i64>, OpError>>)> {
		let semaphore = Arc::new(Semaphore::new(self.max_concurrency.max(1)));
		let mut results = Vec::with_capacity(jobs.len());
		let mut handles = Vec::with_capacity(jobs.len());

		for (index, job) in jobs {
			if self.cancel.is_cancelled() {
				results.push((index, None));
				continue;
			}
			let permit = match Arc::clone(&semaphore).acquire_owned().await {
				Ok(permit) => permit,
				Err(e) => {
					results.push((index, Some(Err(OpError::Task(e.to_string())))));
					continue;
				}
			};
			if self.cancel.is_cancelled() {
				results.push((index, None));
				continue;
			}
			let remote = Arc::clone(&self.remote);
			let timeout = self.timeout;
			handles.push((
				index,
				tokio::spawn(async move {
					let result = call_with_retry(remote.as_ref(), &job, timeout).await;
					drop(permit);
					result
				}),
			));
		}

		// In-flight calls finish even after a cancel.
		for (index, handle) in handles {
			let result = match handle.await {
				Ok(result) => result.map_err(OpError::from),
				Err(e) => Err(OpError::Task(e.to_string())),
			};
			results.push((index, Some(result)));
		}
		results
	}

	/// Field values as the collection stores them: every field of the type plus the key.
	fn remote_fields(&self, record: &Record) -> Vec<(String, String)> {
		let mut fields: Vec<(String, String)> = match self.registry.get(&record.note_type) {
			Some(note_type) => note_type
				.fields
				.iter()
				.map(|spec| {
					let value = record.fields.get(&spec.name).unwrap_or_default();
					(spec.name.clone(), self.transform.render(value))
				})
				.collect(),
			None => record
				.fields
				.iter()
				.map(|(n, v)| (n.to_string(), self.transform.render(v)))
				.collect(),
		};
		if let Some(key) = &record.key {
			fields.push((KEY_FIELD.to_string(), key.clone()));
		}
		fields
	}

	async fn apply_remote(&self, progress: &mut Progress, snapshot: &Snapshot) {
		let mut deck_ids: HashMap<DeckPath, i64> = snapshot
			.decks()
			.filter_map(|(p, id)| id.map(|id| (p.clone(), id)))
			.collect();
		let ops = progress.ops.clone();

		// Deck creates and renames, in plan order.
		let mut deck_changed = false;
		for (index, op) in ops.iter().enumerate() {
			let job = match op {
				Operation::Deck(DeckOp::Create { path }) => RemoteJob::CreateDeck(path.clone()),
				Operation::Deck(DeckOp::Move { from, to, remote_id }) => {
					match remote_id.or_else(|| deck_ids.get(from).copied()) {
						Some(id) => RemoteJob::RenameDeck { id, to: to.clone() },
						None => {
							progress.record(index, Some(Err(RemoteError::NotFound(format!("deck '{from}'")).into())));
							continue;
						}
					}
				}
				_ => continue,
			};
			if self.cancel.is_cancelled() {
				break;
			}
			let result = call_with_retry(self.remote.as_ref(), &job, self.timeout)
				.await
				.map_err(OpError::from);
			if let (Ok(Some(id)), Operation::Deck(op)) = (&result, op) {
				deck_changed = true;
				if let DeckOp::Move { from, to, .. } = op {
					deck_ids = deck_ids
						.into_iter()
						.map(|(p, i)| (p.rebase(from, to).unwrap_or(p), i))
						.collect();
				}
				deck_ids.insert(op.path().clone(), *id);
			}
			let result = result.map(|_| None);
			progress.record(index, Some(result));
		}
		if deck_changed {
			// Renames can give subdecks new ids.
			match self.remote.list_decks().await {
				Ok(decks) => deck_ids = decks.into_iter().map(|d| (d.path, d.id)).collect(),
				Err(e) => tracing::warn!("could not refresh deck ids after deck changes: {e}"),
			}
		}

		let deck_for = |path: &DeckPath| -> Result<RemoteDeck, OpError> {
			deck_ids
				.get(path)
				.map(|id| RemoteDeck {
					id: *id,
					path: path.clone(),
				})
				.ok_or_else(|| RemoteError::NotFound(format!("deck '{path}'")).into())
		};

		for phase in 0..3 {
			let mut jobs = Vec::new();
			for (index, op) in ops.iter().enumerate() {
				let Operation::Record(op) = op else {
					continue;
				};
				let in_phase = match op {
					RecordOp::Create { .. } => phase == 0,
					RecordOp::Update { .. } | RecordOp::Move { .. } => phase == 1,
					RecordOp::Delete { .. } => phase == 2,
				};
				if !in_phase {
					continue;
				}
				if let Some(cause) = progress.blocked(op) {
					progress.record(index, Some(Err(cause)));
					continue;
				}
				let job = match op {
					RecordOp::Create { record } => deck_for(&record.deck).map(|deck| {
						RemoteJob::Create(NewRemoteRecord {
							note_type: record.note_type.clone(),
							fields: self.remote_fields(record),
							deck,
						})
					}),
					RecordOp::Update { at, record, move_to } => remote_id(at).and_then(|id| {
						let move_to = move_to.as_ref().map(&deck_for).transpose()?;
						Ok(RemoteJob::Update {
							id,
							fields: self.remote_fields(record),
							move_to,
						})
					}),
					RecordOp::Move { at, to, .. } => {
						remote_id(at).and_then(|id| Ok(RemoteJob::Move { id, deck: deck_for(to)? }))
					}
					RecordOp::Delete { at, .. } => remote_id(at).map(|id| RemoteJob::Delete { id }),
				};
				match job {
					Ok(job) => jobs.push((index, job)),
					Err(e) => progress.record(index, Some(Err(e))),
				}
			}
			for (index, result) in self.run_batch(jobs).await {
				progress.record(index, result);
			}
		}

		// Deck deletes, deepest first as planned.
		for (index, op) in ops.iter().enumerate() {
			let Operation::Deck(DeckOp::Delete { path, remote_id }) = op else {
				continue;
			};
			if self.cancel.is_cancelled() {
				break;
			}
			if let Some(cause) = progress.deck_delete_blocked(path) {
				progress.record(index, Some(Err(cause)));
				continue;
			}
			let Some(id) = remote_id.or_else(|| deck_ids.get(path).copied()) else {
				progress.record(index, Some(Err(RemoteError::NotFound(format!("deck '{path}'")).into())));
				continue;
			};
			let job = RemoteJob::DeleteDeck(RemoteDeck { id, path: path.clone() });
			let result = call_with_retry(self.remote.as_ref(), &job, self.timeout)
				.await
				.map(|_| None)
				.map_err(OpError::from);
			progress.record(index, Some(result));
		}
	}

	fn apply_files(&self, progress: &mut Progress, files: &mut FileCollection) {
		for index in 0..progress.ops.len() {
			if self.cancel.is_cancelled() {
				break;
			}
			let op = progress.ops[index].clone();
			let result = match &op {
				Operation::Deck(DeckOp::Create { path }) => files.create_deck(path).map_err(OpError::from),
				Operation::Deck(DeckOp::Move { from, to, .. }) => files.rename_deck(from, to).map_err(OpError::from),
				Operation::Deck(DeckOp::Delete { path, .. }) => match progress.deck_delete_blocked(path) {
					Some(cause) => Err(cause),
					None => files.delete_deck(path).map_err(OpError::from),
				},
				Operation::Record(record_op) => match progress.blocked(record_op) {
					Some(cause) => Err(cause),
					None => self.apply_file_record(record_op, files),
				},
			};
			progress.record(index, Some(result.map(|_| None)));
		}

		// Operations on a deck whose file could not be written did not happen.
		for (deck, err) in files.flush() {
			let cause = OpError::from(err);
			for index in 0..progress.ops.len() {
				if progress.status[index] != Some(OpStatus::Applied) {
					continue;
				}
				let touches = match &progress.ops[index] {
					Operation::Deck(DeckOp::Move { from, to, .. }) => deck.starts_with(from) || deck.starts_with(to),
					Operation::Deck(op) => *op.path() == deck,
					Operation::Record(op) => {
						op.source_deck() == Some(&deck) || op.destination_deck() == Some(&deck)
					}
				};
				if touches {
					progress.status[index] = Some(OpStatus::Failed(cause.clone()));
				}
			}
		}
	}

	fn apply_file_record(&self, op: &RecordOp, files: &mut FileCollection) -> Result<(), OpError> {
		match op {
			RecordOp::Create { record } => {
				let text = markdown::render_block(record, None, self.registry);
				files.append_block(&record.deck, text)?;
			}
			RecordOp::Update { at, record, move_to } => {
				let ordinal = ordinal(at)?;
				let preamble = match files.block(&at.deck, ordinal).map(|raw| markdown::parse_block(raw, self.registry)) {
					Some(ParsedBlock::Note(note)) => note.preamble,
					_ => None,
				};
				let text = markdown::render_block(record, preamble.as_deref(), self.registry);
				match move_to {
					Some(to) => {
						if !files.has_deck(to) {
							return Err(CollectionError::UnknownDeck(to.clone()).into());
						}
						files.remove_block(&at.deck, ordinal)?;
						files.append_block(to, text)?;
					}
					None => files.replace_block(&at.deck, ordinal, text)?,
				}
			}
			RecordOp::Move { at, to, .. } => {
				if !files.has_deck(to) {
					return Err(CollectionError::UnknownDeck(to.clone()).into());
				}
				let raw = files.remove_block(&at.deck, ordinal(at)?)?;
				files.append_block(to, raw)?;
			}
			RecordOp::Delete { at, .. } => {
				files.remove_block(&at.deck, ordinal(at)?)?;
			}
		}
		Ok(())
	}
}
