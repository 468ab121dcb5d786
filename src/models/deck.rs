use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between deck segments in the collection's own naming.
pub const DECK_SEPARATOR: &str = "::";
/// Separator between deck segments in a file stem.
pub const STEM_SEPARATOR: &str = "__";

const INVALID_FILENAME_CHARS: &[char] = &['/', '\\', '?', '*', '|', '"', '<', '>'];

#[derive(Debug, Error, PartialEq)]
pub enum DeckNameError {
	#[error("deck name is empty")]
	Empty,

	#[error("deck name '{0}' has an empty segment")]
	EmptySegment(String),

	#[error("deck name '{name}' contains invalid filename characters: {chars:?}")]
	InvalidChars { name: String, chars: Vec<char> },

	#[error("deck name '{0}' starts with a reserved file name")]
	Reserved(String),

	#[error("file stem '{0}' is not a valid deck file name")]
	BadStem(String),
}

/// Hierarchical deck location: top-level deck, subdeck, ...
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeckPath(Vec<String>);

impl DeckPath {
	/// Parse a `::`-separated deck name.
	pub fn parse(name: &str) -> Result<Self, DeckNameError> {
		if name.trim().is_empty() {
			return Err(DeckNameError::Empty);
		}
		let segments: Vec<String> = name.split(DECK_SEPARATOR).map(|s| s.to_string()).collect();
		if segments.iter().any(|s| s.trim().is_empty()) {
			return Err(DeckNameError::EmptySegment(name.to_string()));
		}
		Ok(DeckPath(segments))
	}

	pub fn from_segments<I, S>(segments: I) -> Result<Self, DeckNameError>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
		if segments.is_empty() {
			return Err(DeckNameError::Empty);
		}
		if segments.iter().any(|s| s.trim().is_empty()) {
			return Err(DeckNameError::EmptySegment(segments.join(DECK_SEPARATOR)));
		}
		Ok(DeckPath(segments))
	}

	pub fn segments(&self) -> &[String] {
		&self.0
	}

	pub fn name(&self) -> String {
		self.0.join(DECK_SEPARATOR)
	}

	pub fn top_level(&self) -> &str {
		&self.0[0]
	}

	pub fn depth(&self) -> usize {
		self.0.len()
	}

	pub fn parent(&self) -> Option<DeckPath> {
		if self.0.len() < 2 {
			return None;
		}
		Some(DeckPath(self.0[..self.0.len() - 1].to_vec()))
	}

	/// True if `self` is `other` or lies below it.
	pub fn starts_with(&self, other: &DeckPath) -> bool {
		self.0.len() >= other.0.len() && self.0[..other.0.len()] == other.0[..]
	}

	/// True if `self` lies strictly below `other`.
	pub fn is_descendant_of(&self, other: &DeckPath) -> bool {
		self.0.len() > other.0.len() && self.starts_with(other)
	}

	/// Replace the `from` prefix with `to`. `None` if `self` is not under `from`.
	pub fn rebase(&self, from: &DeckPath, to: &DeckPath) -> Option<DeckPath> {
		if !self.starts_with(from) {
			return None;
		}
		let mut segments = to.0.clone();
		segments.extend_from_slice(&self.0[from.0.len()..]);
		Some(DeckPath(segments))
	}

	/// File stem for this deck (`A::B` -> `A__B`), escaping literal separators.
	pub fn to_file_stem(&self) -> Result<String, DeckNameError> {
		let name = self.name();
		let invalid: Vec<char> = INVALID_FILENAME_CHARS.iter().copied().filter(|c| name.contains(*c)).collect();
		if !invalid.is_empty() {
			return Err(DeckNameError::InvalidChars { name, chars: invalid });
		}
		if is_windows_reserved(self.top_level()) {
			return Err(DeckNameError::Reserved(name));
		}
		let encoded: Vec<String> = self.0.iter().map(|s| encode_segment(s)).collect();
		Ok(encoded.join(STEM_SEPARATOR))
	}

	/// Inverse of [`DeckPath::to_file_stem`].
	pub fn from_file_stem(stem: &str) -> Result<Self, DeckNameError> {
		if stem.is_empty() {
			return Err(DeckNameError::Empty);
		}
		let mut segments = Vec::new();
		for raw in stem.split(STEM_SEPARATOR) {
			if raw.is_empty() || raw.starts_with('_') || raw.ends_with('_') {
				return Err(DeckNameError::BadStem(stem.to_string()));
			}
			segments.push(decode_segment(raw).ok_or_else(|| DeckNameError::BadStem(stem.to_string()))?);
		}
		DeckPath::from_segments(segments)
	}
}

impl fmt::Display for DeckPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.name())
	}
}

impl TryFrom<String> for DeckPath {
	type Error = DeckNameError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		DeckPath::parse(&value)
	}
}

impl From<DeckPath> for String {
	fn from(value: DeckPath) -> Self {
		value.name()
	}
}

fn is_windows_reserved(top_level: &str) -> bool {
	let base = top_level.to_uppercase();
	if matches!(base.as_str(), "CON" | "PRN" | "AUX" | "NUL") {
		return true;
	}
	for prefix in ["COM", "LPT"] {
		if let Some(rest) = base.strip_prefix(prefix) {
			if rest.len() == 1 && matches!(rest.as_bytes()[0], b'1'..=b'9') {
				return true;
			}
		}
	}
	false
}

// `%` is always escaped. An underscore is escaped when it touches another
// underscore or a segment edge, so `__` in a stem is always a separator.
fn encode_segment(segment: &str) -> String {
	let chars: Vec<char> = segment.chars().collect();
	let mut out = String::with_capacity(segment.len());
	for (i, c) in chars.iter().enumerate() {
		match c {
			'%' => out.push_str("%25"),
			'_' => {
				let at_edge = i == 0 || i + 1 == chars.len();
				let in_run = (i > 0 && chars[i - 1] == '_') || chars.get(i + 1) == Some(&'_');
				if at_edge || in_run {
					out.push_str("%5F");
				} else {
					out.push('_');
				}
			}
			other => out.push(*other),
		}
	}
	out
}

fn decode_segment(raw: &str) -> Option<String> {
	let mut out = String::with_capacity(raw.len());
	let mut rest = raw;
	while let Some(pos) = rest.find('%') {
		out.push_str(&rest[..pos]);
		let escape = rest.get(pos..pos + 3)?;
		match escape {
			"%25" => out.push('%'),
			"%5F" | "%5f" => out.push('_'),
			_ => return None,
		}
		rest = &rest[pos + 3..];
	}
	out.push_str(rest);
	Some(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn path(name: &str) -> DeckPath {
		DeckPath::parse(name).unwrap()
	}

	#[test]
	fn subdeck_separator_becomes_double_underscore() {
		assert_eq!(path("A::B").to_file_stem().unwrap(), "A__B");
		assert_eq!(DeckPath::from_file_stem("A__B").unwrap(), path("A::B"));
	}

	#[test]
	fn literal_double_underscore_survives() {
		let deck = path("A__B");
		let stem = deck.to_file_stem().unwrap();
		assert_eq!(stem, "A%5F%5FB");
		assert_eq!(DeckPath::from_file_stem(&stem).unwrap(), deck);
	}

	#[test]
	fn mixed_separator_and_literal_underscores() {
		let deck = path("A::B__C");
		let stem = deck.to_file_stem().unwrap();
		assert_eq!(stem, "A__B%5F%5FC");
		assert_eq!(DeckPath::from_file_stem(&stem).unwrap(), deck);
	}

	#[test]
	fn percent_literal_survives() {
		let deck = path("A%20B");
		let stem = deck.to_file_stem().unwrap();
		assert_eq!(stem, "A%2520B");
		assert_eq!(DeckPath::from_file_stem(&stem).unwrap(), deck);
	}

	#[test]
	fn edge_underscores_do_not_merge_with_separator() {
		let deck = path("a_::_b");
		let stem = deck.to_file_stem().unwrap();
		assert_eq!(stem, "a%5F__%5Fb");
		assert_eq!(DeckPath::from_file_stem(&stem).unwrap(), deck);
	}

	#[test]
	fn single_inner_underscore_is_kept_readable() {
		assert_eq!(path("my_deck").to_file_stem().unwrap(), "my_deck");
		assert_eq!(DeckPath::from_file_stem("my_deck").unwrap(), path("my_deck"));
	}

	#[test]
	fn rejects_invalid_names() {
		assert!(matches!(path("a/b").to_file_stem(), Err(DeckNameError::InvalidChars { .. })));
		assert!(matches!(path("con::x").to_file_stem(), Err(DeckNameError::Reserved(_))));
		assert!(matches!(DeckPath::parse("A::::B"), Err(DeckNameError::EmptySegment(_))));
		assert!(matches!(DeckPath::from_file_stem("A___B"), Err(DeckNameError::BadStem(_))));
		assert!(matches!(DeckPath::from_file_stem("A%2"), Err(DeckNameError::BadStem(_))));
	}

	#[test]
	fn rebase_moves_subtree() {
		let from = path("Biology");
		let to = path("Biology::Advanced");
		assert_eq!(path("Biology::Cells").rebase(&from, &to), Some(path("Biology::Advanced::Cells")));
		assert_eq!(path("Biology").rebase(&from, &to), Some(to.clone()));
		assert_eq!(path("Chemistry").rebase(&from, &to), None);
		assert!(path("Biology::Cells").is_descendant_of(&from));
		assert!(!from.is_descendant_of(&from));
	}
}
