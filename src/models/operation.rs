use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::models::{
	deck::DeckPath,
	record::{Origin, Record},
};

/// Which side is canonical for a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
	/// Files are canonical, the collection is the target.
	Import,
	/// The collection is canonical, files are the target.
	Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
	Files,
	Remote,
}

impl Direction {
	pub fn canonical(self) -> Side {
		match self {
			Direction::Import => Side::Files,
			Direction::Export => Side::Remote,
		}
	}

	pub fn target(self) -> Side {
		match self {
			Direction::Import => Side::Remote,
			Direction::Export => Side::Files,
		}
	}
}

impl fmt::Display for Direction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Direction::Import => f.write_str("import"),
			Direction::Export => f.write_str("export"),
		}
	}
}

impl fmt::Display for Side {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Side::Files => f.write_str("files"),
			Side::Remote => f.write_str("collection"),
		}
	}
}

/// Address of an existing record on the target side, after planned deck renames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
	pub deck: DeckPath,
	pub origin: Origin,
}

impl fmt::Display for Locator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.origin {
			Origin::Remote(id) => write!(f, "note {id} in '{}'", self.deck),
			Origin::File { ordinal } => write!(f, "block {} of '{}'", ordinal + 1, self.deck),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeckOp {
	Create { path: DeckPath },
	/// Rename a deck together with its subdecks.
	Move { from: DeckPath, to: DeckPath, remote_id: Option<i64> },
	Delete { path: DeckPath, remote_id: Option<i64> },
}

impl DeckOp {
	pub fn path(&self) -> &DeckPath {
		match self {
			DeckOp::Create { path } | DeckOp::Delete { path, .. } => path,
			DeckOp::Move { to, .. } => to,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOp {
	/// `record.key` is always set; `record.deck` is the destination deck.
	Create { record: Record },
	Update {
		at: Locator,
		record: Record,
		move_to: Option<DeckPath>,
	},
	Move { at: Locator, record: Record, to: DeckPath },
	Delete { key: Option<String>, label: String, at: Locator },
}

impl RecordOp {
	pub fn key(&self) -> Option<&str> {
		match self {
			RecordOp::Create { record } | RecordOp::Update { record, .. } | RecordOp::Move { record, .. } => {
				record.key.as_deref()
			}
			RecordOp::Delete { key, .. } => key.as_deref(),
		}
	}

	/// Deck the target record sits in before the operation.
	pub fn source_deck(&self) -> Option<&DeckPath> {
		match self {
			RecordOp::Create { .. } => None,
			RecordOp::Update { at, .. } | RecordOp::Move { at, .. } | RecordOp::Delete { at, .. } => Some(&at.deck),
		}
	}

	/// Deck the record occupies after the operation.
	pub fn destination_deck(&self) -> Option<&DeckPath> {
		match self {
			RecordOp::Create { record } => Some(&record.deck),
			RecordOp::Update { at, move_to, .. } => Some(move_to.as_ref().unwrap_or(&at.deck)),
			RecordOp::Move { to, .. } => Some(to),
			RecordOp::Delete { .. } => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
	Deck(DeckOp),
	Record(RecordOp),
}

impl Operation {
	pub fn kind(&self) -> OpKind {
		match self {
			Operation::Deck(DeckOp::Create { .. }) => OpKind::DeckCreate,
			Operation::Deck(DeckOp::Move { .. }) => OpKind::DeckMove,
			Operation::Deck(DeckOp::Delete { .. }) => OpKind::DeckDelete,
			Operation::Record(RecordOp::Create { .. }) => OpKind::Create,
			Operation::Record(RecordOp::Update { .. }) => OpKind::Update,
			Operation::Record(RecordOp::Move { .. }) => OpKind::Move,
			Operation::Record(RecordOp::Delete { .. }) => OpKind::Delete,
		}
	}

	pub fn key(&self) -> Option<&str> {
		match self {
			Operation::Deck(_) => None,
			Operation::Record(op) => op.key(),
		}
	}
}

impl fmt::Display for Operation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Operation::Deck(DeckOp::Create { path }) => write!(f, "create deck '{path}'"),
			Operation::Deck(DeckOp::Move { from, to, .. }) => write!(f, "rename deck '{from}' to '{to}'"),
			Operation::Deck(DeckOp::Delete { path, .. }) => write!(f, "delete deck '{path}'"),
			Operation::Record(RecordOp::Create { record }) => {
				write!(f, "create {} in '{}'", record.label(), record.deck)
			}
			Operation::Record(RecordOp::Update { at, record, move_to }) => match move_to {
				Some(to) => write!(f, "update {} and move {at} to '{to}'", record.label()),
				None => write!(f, "update {} ({at})", record.label()),
			},
			Operation::Record(RecordOp::Move { at, record, to }) => {
				write!(f, "move {} from {at} to '{to}'", record.label())
			}
			Operation::Record(RecordOp::Delete { label, at, .. }) => write!(f, "delete {label} ({at})"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
	DeckCreate,
	DeckMove,
	DeckDelete,
	Create,
	Update,
	Move,
	Delete,
}

impl OpKind {
	fn past_tense(self) -> &'static str {
		match self {
			OpKind::DeckCreate => "deck(s) created",
			OpKind::DeckMove => "deck(s) renamed",
			OpKind::DeckDelete => "deck(s) deleted",
			OpKind::Create => "created",
			OpKind::Update => "updated",
			OpKind::Move => "moved",
			OpKind::Delete => "deleted",
		}
	}
}

/// Operation counts per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
	pub counts: BTreeMap<OpKind, usize>,
}

impl PlanSummary {
	pub fn from_ops<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> Self {
		let mut counts = BTreeMap::new();
		for op in ops {
			*counts.entry(op.kind()).or_insert(0) += 1;
		}
		PlanSummary { counts }
	}

	pub fn count(&self, kind: OpKind) -> usize {
		self.counts.get(&kind).copied().unwrap_or(0)
	}

	pub fn total(&self) -> usize {
		self.counts.values().sum()
	}

	pub fn format(&self) -> String {
		if self.total() == 0 {
			return "no changes".to_string();
		}
		let order = [
			OpKind::Create,
			OpKind::Update,
			OpKind::Move,
			OpKind::Delete,
			OpKind::DeckCreate,
			OpKind::DeckMove,
			OpKind::DeckDelete,
		];
		order
			.iter()
			.filter(|k| self.count(**k) > 0)
			.map(|k| format!("{} {}", self.count(*k), k.past_tense()))
			.collect::<Vec<_>>()
			.join(", ")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn summary_format() {
		assert_eq!(PlanSummary::default().format(), "no changes");

		let deck = DeckPath::parse("A").unwrap();
		let ops = vec![
			Operation::Deck(DeckOp::Create { path: deck.clone() }),
			Operation::Deck(DeckOp::Delete { path: deck.clone(), remote_id: None }),
			Operation::Record(RecordOp::Delete {
				key: None,
				label: "x".into(),
				at: Locator { deck: deck.clone(), origin: Origin::Remote(1) },
			}),
			Operation::Record(RecordOp::Delete {
				key: None,
				label: "y".into(),
				at: Locator { deck, origin: Origin::Remote(2) },
			}),
		];
		let summary = PlanSummary::from_ops(&ops);
		assert_eq!(summary.total(), 4);
		assert_eq!(summary.format(), "2 deleted, 1 deck(s) created, 1 deck(s) deleted");
	}

	#[test]
	fn direction_sides() {
		assert_eq!(Direction::Import.canonical(), Side::Files);
		assert_eq!(Direction::Import.target(), Side::Remote);
		assert_eq!(Direction::Export.canonical(), Side::Remote);
		assert_eq!(Direction::Export.to_string(), "export");
	}
}
