use serde::{Deserialize, Serialize};

use crate::models::{deck::DeckPath, note_type::NoteType};

/// Number of hex characters kept from the blake3 digest.
const HASH_LEN: usize = 16;

/// Ordered `(field name, text)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fields(Vec<(String, String)>);

impl Fields {
	/// Values are trimmed; a repeated name keeps its first value.
	pub fn from_pairs<I>(pairs: I) -> Self
	where
		I: IntoIterator<Item = (String, String)>,
	{
		let mut out: Vec<(String, String)> = Vec::new();
		for (name, value) in pairs {
			if out.iter().any(|(n, _)| *n == name) {
				continue;
			}
			out.push((name, value.trim().to_string()));
		}
		Fields(out)
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Canonical form: descriptor field order, empty values dropped.
	pub fn normalized(&self, note_type: &NoteType) -> Fields {
		let mut out = Vec::with_capacity(self.0.len());
		for spec in &note_type.fields {
			if let Some(value) = self.get(&spec.name).filter(|v| !v.is_empty()) {
				out.push((spec.name.clone(), value.to_string()));
			}
		}
		Fields(out)
	}
}

/// Truncated blake3 digest of a record's type and fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
	pub fn of(note_type: &str, fields: &Fields) -> Self {
		let payload = serde_json::json!({
			"note_type": note_type,
			"fields": fields.0,
		});
		let hex = blake3::hash(payload.to_string().as_bytes()).to_hex();
		ContentHash(hex[..HASH_LEN].to_string())
	}

	/// A hash read back from the mapping store.
	pub fn stored(value: String) -> Self {
		ContentHash(value)
	}

	/// Placeholder for rows rebuilt without a content baseline.
	pub fn unknown() -> Self {
		ContentHash(String::new())
	}

	pub fn is_unknown(&self) -> bool {
		self.0.is_empty()
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

/// Where a record was read from, per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
	Remote(i64),
	/// Block index inside the deck file.
	File { ordinal: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
	pub key: Option<String>,
	pub note_type: String,
	pub fields: Fields,
	pub deck: DeckPath,
	pub origin: Origin,
	pub hash: ContentHash,
}

impl Record {
	pub fn new(key: Option<String>, note_type: &str, fields: Fields, deck: DeckPath, origin: Origin) -> Self {
		let hash = ContentHash::of(note_type, &fields);
		Record {
			key,
			note_type: note_type.to_string(),
			fields,
			deck,
			origin,
			hash,
		}
	}

	pub fn remote_id(&self) -> Option<i64> {
		match self.origin {
			Origin::Remote(id) => Some(id),
			Origin::File { .. } => None,
		}
	}

	/// Short label for reports: the key, or the first line of the first field.
	pub fn label(&self) -> String {
		if let Some(key) = &self.key {
			return key.clone();
		}
		let first = self.fields.iter().next().map(|(_, v)| v).unwrap_or_default();
		let line = first.lines().next().unwrap_or_default();
		let short: String = line.chars().take(40).collect();
		format!("'{short}'")
	}

	pub fn with_key(mut self, key: String) -> Self {
		self.key = Some(key);
		self
	}
}

/// Fresh record key.
pub fn new_key() -> String {
	ulid::Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::models::note_type::NoteTypeRegistry;

	fn pairs(p: &[(&str, &str)]) -> Fields {
		Fields::from_pairs(p.iter().map(|(k, v)| (k.to_string(), v.to_string())))
	}

	#[test]
	fn hash_ignores_field_order_after_normalizing() {
		let reg = NoteTypeRegistry::default();
		let qa = reg.get("CardSyncQA").unwrap();
		let a = pairs(&[("Answer", "a"), ("Question", "q")]).normalized(qa);
		let b = pairs(&[("Question", " q "), ("Answer", "a"), ("Extra", "")]).normalized(qa);
		assert_eq!(a, b);
		assert_eq!(ContentHash::of("CardSyncQA", &a), ContentHash::of("CardSyncQA", &b));
	}

	#[test]
	fn hash_covers_type_and_content() {
		let f = pairs(&[("Question", "q"), ("Answer", "a")]);
		let base = ContentHash::of("CardSyncQA", &f);
		assert_eq!(base.as_str().len(), HASH_LEN);
		assert_ne!(base, ContentHash::of("CardSyncInput", &f));
		assert_ne!(base, ContentHash::of("CardSyncQA", &pairs(&[("Question", "q"), ("Answer", "b")])));
	}

	#[test]
	fn label_falls_back_to_first_line() {
		let deck = DeckPath::parse("Deck").unwrap();
		let rec = Record::new(
			None,
			"CardSyncQA",
			pairs(&[("Question", "What is ATP?\nmore"), ("Answer", "x")]),
			deck,
			Origin::File { ordinal: 0 },
		);
		assert_eq!(rec.label(), "'What is ATP?'");
		assert_eq!(rec.with_key("01J".into()).label(), "01J");
	}

	#[test]
	fn keys_are_unique() {
		assert_ne!(new_key(), new_key());
	}
}
