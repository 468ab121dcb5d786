use std::{
	collections::{BTreeMap, BTreeSet, HashMap},
	fmt,
};

use crate::{
	engine::snapshot::Snapshot,
	models::{deck::DeckPath, mapping::MappingState},
};

/// Disagreement between the mapping store and what the sides hold now.
#[derive(Debug, Clone, PartialEq)]
pub enum Finding {
	MissingRecordMapping { key: String },
	StaleRecordMapping { key: String, remote_id: i64 },
	MissingDeckMapping { path: DeckPath, remote_id: i64 },
	StaleDeckMapping { remote_id: i64, recorded: DeckPath, current: DeckPath },
	OrphanDeckMapping { path: DeckPath, remote_id: i64 },
	ReconstructedStore { rows: usize },
}

impl fmt::Display for Finding {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Finding::MissingRecordMapping { key } => write!(f, "no mapping for '{key}'"),
			Finding::StaleRecordMapping { key, remote_id } => {
				write!(f, "'{key}' is mapped to note {remote_id}, which no longer exists")
			}
			Finding::MissingDeckMapping { path, remote_id } => write!(f, "no mapping for deck '{path}' ({remote_id})"),
			Finding::StaleDeckMapping {
				remote_id,
				recorded,
				current,
			} => write!(f, "deck {remote_id} was renamed from '{recorded}' to '{current}'"),
			Finding::OrphanDeckMapping { path, remote_id } => {
				write!(f, "deck '{path}' ({remote_id}) no longer exists")
			}
			Finding::ReconstructedStore { rows } => write!(f, "mapping store rebuilt with {rows} rows"),
		}
	}
}

/// Which key a remote note is taken to carry this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
	Resolved(String),
	/// Mapping and embedded marker disagree.
	Contested { mapped: String, embedded: String },
	Unkeyed,
}

impl Identity {
	fn claim(&self) -> Option<&str> {
		match self {
			Identity::Resolved(key) => Some(key),
			Identity::Contested { mapped, .. } => Some(mapped),
			Identity::Unkeyed => None,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct DriftReport {
	pub findings: Vec<Finding>,
	identities: HashMap<i64, Identity>,
}

impl DriftReport {
	pub fn identity(&self, remote_id: i64) -> &Identity {
		self.identities.get(&remote_id).unwrap_or(&Identity::Unkeyed)
	}

	pub fn stale_keys(&self) -> impl Iterator<Item = &str> {
		self.findings.iter().filter_map(|f| match f {
			Finding::StaleRecordMapping { key, .. } => Some(key.as_str()),
			_ => None,
		})
	}

	/// Renamed remote decks, shallowest recorded path first.
	pub fn deck_renames(&self) -> Vec<(i64, &DeckPath, &DeckPath)> {
		let mut renames: Vec<(i64, &DeckPath, &DeckPath)> = self
			.findings
			.iter()
			.filter_map(|f| match f {
				Finding::StaleDeckMapping {
					remote_id,
					recorded,
					current,
				} => Some((*remote_id, recorded, current)),
				_ => None,
			})
			.collect();
		renames.sort_by(|a, b| a.1.depth().cmp(&b.1.depth()).then_with(|| a.1.cmp(b.1)));
		renames
	}
}

/// Compare both snapshots with the mapping store. Never blocks a pass.
pub fn classify(files: &Snapshot, remote: &Snapshot, mapping: &MappingState) -> DriftReport {
	let mut report = DriftReport::default();

	for record in remote.records() {
		let Some(id) = record.remote_id() else {
			continue;
		};
		let mapped = mapping.key_for_remote(id);
		let identity = match (mapped, record.key.as_deref()) {
			(Some(m), Some(e)) if m != e => Identity::Contested {
				mapped: m.to_string(),
				embedded: e.to_string(),
			},
			(Some(m), _) => Identity::Resolved(m.to_string()),
			(None, Some(e)) => match mapping.note(e) {
				// The mapping binds this key to another note that still exists.
				Some(row) if row.remote_id != id && remote.by_remote_id(row.remote_id).is_some() => Identity::Unkeyed,
				_ => Identity::Resolved(e.to_string()),
			},
			(None, None) => Identity::Unkeyed,
		};
		report.identities.insert(id, identity);
	}
	dedupe_claims(&mut report.identities, mapping);

	let mut missing: BTreeSet<&str> = BTreeSet::new();
	for identity in report.identities.values() {
		if let Identity::Resolved(key) = identity {
			if mapping.note(key).is_none() {
				missing.insert(key);
			}
		}
	}
	for key in files.records().iter().filter_map(|r| r.key.as_deref()) {
		if mapping.note(key).is_none() {
			missing.insert(key);
		}
	}
	report.findings.extend(missing.into_iter().map(|key| Finding::MissingRecordMapping { key: key.to_string() }));

	for row in mapping.notes() {
		if remote.scope.contains(&row.deck_path) && remote.by_remote_id(row.remote_id).is_none() {
			report.findings.push(Finding::StaleRecordMapping {
				key: row.key.clone(),
				remote_id: row.remote_id,
			});
		}
	}

	for row in mapping.decks() {
		match remote.deck_path_for(row.remote_id) {
			Some(current) if *current != row.path => report.findings.push(Finding::StaleDeckMapping {
				remote_id: row.remote_id,
				recorded: row.path.clone(),
				current: current.clone(),
			}),
			Some(_) => {}
			None if remote.is_foreign_deck(row.remote_id) => {}
			None if remote.scope.contains(&row.path) => report.findings.push(Finding::OrphanDeckMapping {
				path: row.path.clone(),
				remote_id: row.remote_id,
			}),
			None => {}
		}
	}

	let holding = remote.decks_with_records();
	for (path, id) in remote.decks() {
		let Some(id) = id else {
			continue;
		};
		if mapping.deck_path_for(id).is_none() && (files.has_deck(path) || holding.contains(path)) {
			report.findings.push(Finding::MissingDeckMapping {
				path: path.clone(),
				remote_id: id,
			});
		}
	}

	if mapping.reconstructed {
		report.findings.push(Finding::ReconstructedStore {
			rows: mapping.note_count(),
		});
	}

	for finding in &report.findings {
		tracing::debug!("drift: {finding}");
	}
	report
}

// Rule for a key claimed by several notes: the note the mapping binds keeps
// it, otherwise the lowest id. The others become unkeyed.
fn dedupe_claims(identities: &mut HashMap<i64, Identity>, mapping: &MappingState) {
	let mut claims: BTreeMap<String, Vec<i64>> = BTreeMap::new();
	for (id, identity) in identities.iter() {
		if let Some(key) = identity.claim() {
			claims.entry(key.to_string()).or_default().push(*id);
		}
	}
	for (key, mut ids) in claims {
		if ids.len() < 2 {
			continue;
		}
		ids.sort_unstable();
		let keeper = ids
			.iter()
			.copied()
			.find(|id| mapping.key_for_remote(*id) == Some(key.as_str()))
			.unwrap_or(ids[0]);
		for id in ids.into_iter().filter(|id| *id != keeper) {
			tracing::warn!("note {id} carries key '{key}' already held by note {keeper}; treating it as unkeyed");
			identities.insert(id, Identity::Unkeyed);
		}
	}
}
