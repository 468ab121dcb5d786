use std::{
	collections::{BTreeMap, BTreeSet, HashMap, HashSet},
	fmt,
};

use crate::{
	engine::{
		conflict::{self, Conflict, Resolution},
		drift::{DriftReport, Identity},
		snapshot::Snapshot,
	},
	models::{
		deck::DeckPath,
		mapping::MappingState,
		operation::{DeckOp, Direction, Locator, Operation, PlanSummary, RecordOp, Side},
		record::{new_key, ContentHash, Origin, Record},
	},
};

/// A pair that already agrees; only its mapping row may need refreshing.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
	pub key: String,
	pub remote_id: i64,
	pub deck: DeckPath,
	pub hash: ContentHash,
}

/// Key marker to write on a record that lacks it or carries the wrong one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stamp {
	File { deck: DeckPath, ordinal: usize, key: String },
	Remote { remote_id: i64, key: String },
}

impl Stamp {
	pub fn key(&self) -> &str {
		match self {
			Stamp::File { key, .. } | Stamp::Remote { key, .. } => key,
		}
	}
}

impl fmt::Display for Stamp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Stamp::File { deck, ordinal, key } => write!(f, "mark block {} of '{deck}' as '{key}'", ordinal + 1),
			Stamp::Remote { remote_id, key } => write!(f, "mark note {remote_id} as '{key}'"),
		}
	}
}

/// A record the planner had to leave alone.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanIssue {
	pub key: Option<String>,
	pub label: String,
	pub reason: String,
}

impl fmt::Display for PlanIssue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}: {}", self.label, self.reason)
	}
}

/// A target deck holding records the canonical side does not know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UntrackedDeck {
	pub side: Side,
	pub path: DeckPath,
	pub records: usize,
}

#[derive(Debug, Clone)]
pub struct Plan {
	pub direction: Direction,
	pub operations: Vec<Operation>,
	pub bindings: Vec<Binding>,
	/// Mapping rows to drop.
	pub unbind: Vec<String>,
	pub conflicts: Vec<(Conflict, Resolution)>,
	pub issues: Vec<PlanIssue>,
	pub untracked: Vec<UntrackedDeck>,
	pub stamps: Vec<Stamp>,
}

impl Plan {
	pub fn new(direction: Direction) -> Self {
		Plan {
			direction,
			operations: Vec::new(),
			bindings: Vec::new(),
			unbind: Vec::new(),
			conflicts: Vec::new(),
			issues: Vec::new(),
			untracked: Vec::new(),
			stamps: Vec::new(),
		}
	}

	pub fn summary(&self) -> PlanSummary {
		PlanSummary::from_ops(&self.operations)
	}

	/// Nothing to write on either side.
	pub fn is_empty(&self) -> bool {
		self.operations.is_empty() && self.stamps.is_empty()
	}
}

/// Work out what the target needs so that it matches the canonical side.
pub fn plan(
	direction: Direction,
	canonical: &Snapshot,
	target: &Snapshot,
	mapping: &MappingState,
	drift: &DriftReport,
) -> Plan {
	let (files, remote) = match direction {
		Direction::Import => (canonical, target),
		Direction::Export => (target, canonical),
	};
	let mut planner = Planner {
		direction,
		canonical,
		target,
		files,
		remote,
		mapping,
		drift,
		plan: Plan::new(direction),
		remote_keys: HashMap::new(),
		blocked: BTreeSet::new(),
		renames: Vec::new(),
		staying: BTreeMap::new(),
		leaving: HashSet::new(),
	};
	planner.resolve_identities();
	planner.plan_renames();
	let target_decks = planner.target_decks();
	let canonical_decks = planner.canonical_decks(&target_decks);
	let tracked = planner.tracked_decks(&canonical_decks);

	let mut deck_ops = std::mem::take(&mut planner.plan.operations);
	for path in sorted_by_depth(canonical_decks.iter().filter(|d| !target_decks.contains_key(*d))) {
		deck_ops.push(Operation::Deck(DeckOp::Create { path: path.clone() }));
	}

	planner.plan_records(&tracked);
	planner.plan_deck_deletes(&target_decks, &canonical_decks, &tracked);
	planner.report_untracked(&target_decks, &canonical_decks);
	planner.plan_identity_stamps();

	let mut plan = planner.plan;
	plan.unbind.extend(drift.stale_keys().map(str::to_string));
	plan.unbind.sort();
	plan.unbind.dedup();
	deck_ops.append(&mut plan.operations);
	plan.operations = deck_ops;
	plan
}

struct Planner<'a> {
	direction: Direction,
	canonical: &'a Snapshot,
	target: &'a Snapshot,
	files: &'a Snapshot,
	remote: &'a Snapshot,
	mapping: &'a MappingState,
	drift: &'a DriftReport,
	plan: Plan,
	/// Key each remote note carries this pass; `None` if unkeyed.
	remote_keys: HashMap<i64, Option<String>>,
	/// Keys involved in an unresolved identity conflict.
	blocked: BTreeSet<String>,
	/// Planned deck renames in target path space, in order.
	renames: Vec<(DeckPath, DeckPath)>,
	/// Target records that stay in their deck, per deck after renames.
	staying: BTreeMap<DeckPath, usize>,
	/// Keys whose target record is deleted this pass.
	leaving: HashSet<String>,
}

impl<'a> Planner<'a> {
	fn resolve_identities(&mut self) {
		let (remote, drift) = (self.remote, self.drift);
		let claimed: HashMap<&str, i64> = remote
			.records()
			.iter()
			.filter_map(|r| {
				let id = r.remote_id()?;
				match drift.identity(id) {
					Identity::Resolved(key) => Some((key.as_str(), id)),
					_ => None,
				}
			})
			.collect();

		for record in remote.records() {
			let Some(id) = record.remote_id() else {
				continue;
			};
			let key = match drift.identity(id) {
				Identity::Resolved(key) => Some(key.clone()),
				Identity::Unkeyed => None,
				Identity::Contested { mapped, embedded } => {
					let conflict = Conflict::IdentityMismatch {
						remote_id: id,
						mapped: mapped.clone(),
						embedded: embedded.clone(),
						mapped_matches: self.content_matches(mapped, record),
						embedded_matches: self.content_matches(embedded, record),
					};
					let mut resolution = conflict::resolve(&conflict, self.direction);
					if let Resolution::Rebind { key } = &resolution {
						if claimed.get(key.as_str()).is_some_and(|holder| *holder != id) {
							resolution = Resolution::FailOperation {
								reason: format!("key '{key}' is already held by another note"),
							};
						}
					}
					tracing::warn!("conflict: {conflict}; {resolution}");
					let key = match &resolution {
						Resolution::Rebind { key } => {
							if key != mapped {
								self.plan.unbind.push(mapped.clone());
							}
							Some(key.clone())
						}
						Resolution::FailOperation { reason } => {
							self.blocked.insert(mapped.clone());
							self.blocked.insert(embedded.clone());
							self.plan.issues.push(PlanIssue {
								key: Some(mapped.clone()),
								label: format!("note {id}"),
								reason: reason.clone(),
							});
							None
						}
						Resolution::HardFail | Resolution::Overwrite { .. } => None,
					};
					self.plan.conflicts.push((conflict, resolution));
					if key.is_none() {
						// Blocked: neither created, deleted nor rebound.
						continue;
					}
					key
				}
			};
			self.remote_keys.insert(id, key);
		}
	}

	/// Does `record` hold the content recorded for `key`, or the content the file side has for it?
	fn content_matches(&self, key: &str, record: &Record) -> bool {
		let recorded = self.mapping.note(key).is_some_and(|row| row.content_hash == record.hash);
		let on_file = self
			.files
			.get(key)
			.is_some_and(|f| f.hash == record.hash && f.note_type == record.note_type);
		recorded || on_file
	}

	/// Key of a record on either side, after identity resolution. `None` for blocked notes too.
	fn key_of(&self, record: &Record) -> Option<Option<String>> {
		match record.remote_id() {
			Some(id) => self.remote_keys.get(&id).cloned(),
			None => Some(record.key.clone()),
		}
	}

	fn view(&self, snapshot: &'a Snapshot) -> (BTreeMap<String, &'a Record>, Vec<&'a Record>) {
		let mut keyed = BTreeMap::new();
		let mut unkeyed = Vec::new();
		for record in snapshot.records() {
			match self.key_of(record) {
				Some(Some(key)) => {
					keyed.entry(key).or_insert(record);
				}
				Some(None) => unkeyed.push(record),
				None => {}
			}
		}
		(keyed, unkeyed)
	}

	fn rebase(&self, path: &DeckPath) -> DeckPath {
		let mut path = path.clone();
		for (from, to) in &self.renames {
			if let Some(moved) = path.rebase(from, to) {
				path = moved;
			}
		}
		path
	}

	fn plan_renames(&mut self) {
		let drift = self.drift;
		let mut current_target: BTreeSet<DeckPath> = self.target.decks().map(|(p, _)| p.clone()).collect();
		for (remote_id, recorded, current) in drift.deck_renames() {
			let (from, to) = match self.direction {
				// Follow the collection's rename in the deck files.
				Direction::Export => (self.rebase(recorded), current.clone()),
				// The file still has the old name: rename the deck back.
				Direction::Import => {
					if !self.files.has_deck(recorded) || self.files.has_deck(current) {
						continue;
					}
					(self.rebase(current), recorded.clone())
				}
			};
			if from == to || !current_target.contains(&from) || current_target.contains(&to) {
				continue;
			}
			tracing::info!("deck '{from}' renamed to '{to}' ({remote_id})");
			current_target = current_target
				.into_iter()
				.map(|p| p.rebase(&from, &to).unwrap_or(p))
				.collect();
			self.plan.operations.push(Operation::Deck(DeckOp::Move {
				from: from.clone(),
				to: to.clone(),
				remote_id: Some(remote_id),
			}));
			self.renames.push((from, to));
		}
	}

	/// Target decks after planned renames, with the path they were read under.
	fn target_decks(&self) -> BTreeMap<DeckPath, DeckPath> {
		self.target.decks().map(|(p, _)| (self.rebase(p), p.clone())).collect()
	}

	fn canonical_decks(&self, target_decks: &BTreeMap<DeckPath, DeckPath>) -> BTreeSet<DeckPath> {
		match self.direction {
			Direction::Import => self.files.decks().map(|(p, _)| p.clone()).collect(),
			Direction::Export => {
				let holding = self.remote.decks_with_records();
				self.remote
					.decks()
					.filter(|(path, id)| {
						holding.contains(path)
							|| id.is_some_and(|id| self.mapping.deck_path_for(id).is_some())
							|| target_decks.contains_key(*path)
					})
					.map(|(p, _)| p.clone())
					.collect()
			}
		}
	}

	/// Decks whose contents the canonical side answers for.
	fn tracked_decks(&self, canonical_decks: &BTreeSet<DeckPath>) -> BTreeSet<DeckPath> {
		let mut tracked = canonical_decks.clone();
		tracked.extend(self.mapping.decks().map(|row| self.rebase(&row.path)));
		if self.target.side == Side::Remote {
			for (path, id) in self.target.decks() {
				if id.is_some_and(|id| self.mapping.deck_path_for(id).is_some()) {
					tracked.insert(self.rebase(path));
				}
			}
		}
		tracked
	}

	fn remote_id_of(&self, canonical: &Record, target: &Record) -> Option<i64> {
		canonical.remote_id().or(target.remote_id())
	}

	fn plan_records(&mut self, tracked: &BTreeSet<DeckPath>) {
		let (mapping, drift) = (self.mapping, self.drift);
		let (canonical_view, canonical_unkeyed) = self.view(self.canonical);
		let (target_view, target_unkeyed) = self.view(self.target);
		let stale: HashSet<&str> = drift.stale_keys().collect();
		let reconstructed = self.mapping.reconstructed;

		let keys: BTreeSet<&String> = canonical_view.keys().chain(target_view.keys()).collect();
		let mut records = Vec::new();
		for key in keys {
			let c = canonical_view.get(key).copied();
			let t = target_view.get(key).copied();
			let row = mapping.note(key).filter(|_| !stale.contains(key.as_str()));
			if self.blocked.contains(key) {
				if let Some(t) = t {
					self.stay(&t.deck);
				}
				continue;
			}

			match (c, t) {
				(Some(c), None) => {
					if self.target.excluded_keys.contains(key) {
						self.plan.issues.push(PlanIssue {
							key: Some(key.clone()),
							label: key.clone(),
							reason: format!("unreadable on the {} side; not recreated", self.target.side),
						});
						continue;
					}
					records.push(Operation::Record(RecordOp::Create {
						record: c.clone().with_key(key.clone()),
					}));
				}
				(None, Some(t)) => {
					let deck = self.rebase(&t.deck);
					if self.canonical.excluded_keys.contains(key) || (row.is_none() && !tracked.contains(&deck)) {
						self.stay(&t.deck);
						continue;
					}
					self.leaving.insert(key.clone());
					records.push(Operation::Record(RecordOp::Delete {
						key: Some(key.clone()),
						label: key.clone(),
						at: Locator {
							deck,
							origin: t.origin,
						},
					}));
				}
				(Some(c), Some(t)) => {
					let deck = self.rebase(&t.deck);
					if c.note_type != t.note_type {
						self.plan.issues.push(PlanIssue {
							key: Some(key.clone()),
							label: key.clone(),
							reason: format!(
								"note type changed from {} to {}; change it on both sides",
								t.note_type, c.note_type
							),
						});
						self.stay(&t.deck);
						continue;
					}
					let at = Locator {
						deck: deck.clone(),
						origin: t.origin,
					};
					let record = c.clone().with_key(key.clone());
					let move_to = (c.deck != deck).then(|| c.deck.clone());
					if move_to.is_none() {
						self.stay(&t.deck);
					}

					if c.hash != t.hash {
						if let Some(row) = row {
							let baseline = !reconstructed && !row.content_hash.is_unknown();
							if baseline && row.content_hash != c.hash && row.content_hash != t.hash {
								let conflict = Conflict::Diverged {
									key: key.clone(),
									recorded: row.content_hash.clone(),
									canonical: c.hash.clone(),
									target: t.hash.clone(),
								};
								let resolution = conflict::resolve(&conflict, self.direction);
								tracing::warn!("conflict: {conflict}; {resolution}");
								self.plan.conflicts.push((conflict, resolution));
							}
						}
						records.push(Operation::Record(RecordOp::Update { at, record, move_to }));
					} else if let Some(to) = move_to {
						records.push(Operation::Record(RecordOp::Move { at, record, to }));
					} else if let Some(remote_id) = self.remote_id_of(c, t) {
						self.plan.bindings.push(Binding {
							key: key.clone(),
							remote_id,
							deck: c.deck.clone(),
							hash: c.hash.clone(),
						});
					}
				}
				(None, None) => {}
			}
		}

		for c in canonical_unkeyed {
			let key = new_key();
			let stamp = match c.origin {
				Origin::File { ordinal } => Stamp::File {
					deck: c.deck.clone(),
					ordinal,
					key: key.clone(),
				},
				Origin::Remote(remote_id) => Stamp::Remote {
					remote_id,
					key: key.clone(),
				},
			};
			self.plan.stamps.push(stamp);
			records.push(Operation::Record(RecordOp::Create {
				record: c.clone().with_key(key),
			}));
		}

		for t in target_unkeyed {
			let deck = self.rebase(&t.deck);
			if !tracked.contains(&deck) {
				self.stay(&t.deck);
				continue;
			}
			records.push(Operation::Record(RecordOp::Delete {
				key: None,
				label: t.label(),
				at: Locator {
					deck,
					origin: t.origin,
				},
			}));
		}

		// Creates, then updates and moves, then deletes.
		records.sort_by_key(|op| match op {
			Operation::Record(RecordOp::Create { .. }) => 0,
			Operation::Record(RecordOp::Update { .. } | RecordOp::Move { .. }) => 1,
			_ => 2,
		});
		self.plan.operations.extend(records);
	}

	fn stay(&mut self, deck: &DeckPath) {
		let deck = self.rebase(deck);
		*self.staying.entry(deck).or_insert(0) += 1;
	}

	fn plan_deck_deletes(
		&mut self,
		target_decks: &BTreeMap<DeckPath, DeckPath>,
		canonical_decks: &BTreeSet<DeckPath>,
		tracked: &BTreeSet<DeckPath>,
	) {
		let mut candidates: Vec<&DeckPath> = target_decks.keys().filter(|d| !canonical_decks.contains(*d)).collect();
		candidates.sort_by(|a, b| b.depth().cmp(&a.depth()).then_with(|| a.cmp(b)));

		let mut deleting: BTreeSet<&DeckPath> = BTreeSet::new();
		for deck in candidates {
			let read_as = &target_decks[deck];
			let keep = !tracked.contains(deck)
				|| canonical_decks.iter().any(|c| c.is_descendant_of(deck))
				|| self.target.unmanaged_in(read_as) > 0
				|| self.staying.get(deck).copied().unwrap_or(0) > 0
				|| target_decks
					.keys()
					.any(|d| d.is_descendant_of(deck) && !deleting.contains(d));
			// A deck that only exists as a mapping row has nothing to delete.
			let mapped = self.mapping.deck_id(deck).is_some()
				|| self.target.deck_id(read_as).is_some_and(|id| self.mapping.deck_path_for(id).is_some());
			if keep || !mapped {
				continue;
			}
			deleting.insert(deck);
			self.plan.operations.push(Operation::Deck(DeckOp::Delete {
				path: deck.clone(),
				remote_id: self.target.deck_id(read_as),
			}));
		}
	}

	fn report_untracked(&mut self, target_decks: &BTreeMap<DeckPath, DeckPath>, canonical_decks: &BTreeSet<DeckPath>) {
		let deleted: BTreeSet<&DeckPath> = self
			.plan
			.operations
			.iter()
			.filter_map(|op| match op {
				Operation::Deck(DeckOp::Delete { path, .. }) => Some(path),
				_ => None,
			})
			.collect();
		let mut untracked = Vec::new();
		for deck in target_decks.keys() {
			if canonical_decks.contains(deck) || deleted.contains(deck) {
				continue;
			}
			let records = self.staying.get(deck).copied().unwrap_or(0);
			if records > 0 {
				untracked.push(UntrackedDeck {
					side: self.target.side,
					path: deck.clone(),
					records,
				});
			}
		}
		for deck in &untracked {
			tracing::info!("untracked deck '{}' on the {} side ({} records)", deck.path, deck.side, deck.records);
		}
		self.plan.untracked = untracked;
	}

	/// Re-mark remote notes whose embedded key differs from the key they are bound to.
	fn plan_identity_stamps(&mut self) {
		let stamped: HashSet<i64> = self
			.plan
			.stamps
			.iter()
			.filter_map(|s| match s {
				Stamp::Remote { remote_id, .. } => Some(*remote_id),
				Stamp::File { .. } => None,
			})
			.collect();
		let mut fixes = Vec::new();
		for record in self.remote.records() {
			let Some(id) = record.remote_id() else {
				continue;
			};
			let Some(Some(key)) = self.remote_keys.get(&id) else {
				continue;
			};
			let deleted = self.direction == Direction::Import && self.leaving.contains(key);
			if record.key.as_ref() != Some(key) && !stamped.contains(&id) && !deleted {
				fixes.push(Stamp::Remote {
					remote_id: id,
					key: key.clone(),
				});
			}
		}
		self.plan.stamps.extend(fixes);
	}
}

fn sorted_by_depth<'d>(decks: impl Iterator<Item = &'d DeckPath>) -> Vec<&'d DeckPath> {
	let mut decks: Vec<&DeckPath> = decks.collect();
	decks.sort_by(|a, b| a.depth().cmp(&b.depth()).then_with(|| a.cmp(b)));
	decks
}
