use std::{
	collections::{BTreeSet, HashMap},
	sync::OnceLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::record::Fields;

/// Remote field holding the record key. Never written as a file prefix.
pub const KEY_FIELD: &str = "CardSync Key";

/// Prefix shared by every built-in type name.
pub const BUILTIN_PREFIX: &str = "CardSync";

#[derive(Debug, Error, PartialEq)]
pub enum NoteTypeError {
	#[error("prefix '{prefix}' maps to '{existing}' but '{note_type}' maps it to '{field}'")]
	InconsistentPrefix {
		prefix: String,
		existing: String,
		note_type: String,
		field: String,
	},

	#[error("note type '{0}' uses the reserved field name '{KEY_FIELD}'")]
	ReservedField(String),

	#[error("note type '{note_type}' uses reserved built-in prefix '{prefix}'")]
	ReservedPrefix { note_type: String, prefix: String },

	#[error("note type '{0}' uses a reserved or duplicate name")]
	ReservedName(String),

	#[error("note type '{0}' has no identifying field")]
	NoIdentifyingField(String),

	#[error("note types '{0}' and '{1}' have identical identifying fields")]
	Ambiguous(String, String),

	#[error("note type '{0}' is a choice type but has no field containing 'Choice'")]
	ChoiceWithoutChoices(String),

	#[error("note type '{0}' cannot be both cloze and choice")]
	ConflictingKind(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
	pub name: String,
	pub prefix: String,
	#[serde(default)]
	pub identifying: bool,
}

impl FieldSpec {
	fn new(name: &str, prefix: &str, identifying: bool) -> Self {
		FieldSpec {
			name: name.to_string(),
			prefix: prefix.to_string(),
			identifying,
		}
	}

	fn is_choice(&self) -> bool {
		self.name.contains("Choice")
	}
}

/// Extra validation rules a type carries beyond its field signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
	Standard,
	Cloze,
	Choice,
}

/// Type descriptor: field-prefix signature plus the rules of its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteType {
	pub name: String,
	pub fields: Vec<FieldSpec>,
	pub kind: NoteKind,
	pub builtin: bool,
}

impl NoteType {
	pub fn custom(name: &str, fields: Vec<FieldSpec>, kind: NoteKind) -> Self {
		NoteType {
			name: name.to_string(),
			fields,
			kind,
			builtin: false,
		}
	}

	pub fn field(&self, name: &str) -> Option<&FieldSpec> {
		self.fields.iter().find(|f| f.name == name)
	}

	/// Field names the collection's model must carry, key field last.
	pub fn collection_fields(&self) -> Vec<&str> {
		self.fields
			.iter()
			.map(|f| f.name.as_str())
			.chain(std::iter::once(KEY_FIELD))
			.collect()
	}

	pub fn identifying_prefixes(&self) -> BTreeSet<&str> {
		self.fields.iter().filter(|f| f.identifying).map(|f| f.prefix.as_str()).collect()
	}

	fn field_names(&self) -> BTreeSet<&str> {
		self.fields.iter().map(|f| f.name.as_str()).collect()
	}

	fn accepts(&self, present: &BTreeSet<&str>) -> bool {
		let all = self.field_names();
		if !present.is_subset(&all) {
			return false;
		}
		match self.kind {
			NoteKind::Choice => {
				let base_ok = self
					.fields
					.iter()
					.filter(|f| f.identifying && !f.is_choice())
					.all(|f| present.contains(f.name.as_str()));
				let any_choice = self.fields.iter().any(|f| f.is_choice() && present.contains(f.name.as_str()));
				base_ok && any_choice
			}
			_ => self
				.fields
				.iter()
				.filter(|f| f.identifying)
				.all(|f| present.contains(f.name.as_str())),
		}
	}

	/// Rule violations for a record already matched to this type.
	pub fn validate(&self, fields: &Fields) -> Vec<String> {
		let mut errors = Vec::new();
		for spec in self.fields.iter().filter(|f| f.identifying && !f.is_choice()) {
			if fields.get(&spec.name).is_none_or_empty() {
				errors.push(format!("missing mandatory field '{}' ({})", spec.name, spec.prefix));
			}
		}
		match self.kind {
			NoteKind::Standard => {}
			NoteKind::Cloze => {
				if !fields.iter().any(|(_, v)| cloze_pattern().is_match(v)) {
					errors.push(format!("{} note must contain cloze syntax (e.g. {{{{c1::answer}}}})", self.name));
				}
			}
			NoteKind::Choice => errors.extend(self.validate_choices(fields)),
		}
		errors
	}

	fn validate_choices(&self, fields: &Fields) -> Vec<String> {
		let filled: Vec<usize> = self
			.fields
			.iter()
			.filter(|f| f.is_choice())
			.filter(|f| !fields.get(&f.name).is_none_or_empty())
			.filter_map(|f| f.name.split_whitespace().last().and_then(|n| n.parse().ok()))
			.collect();
		if filled.len() < 2 {
			return vec![format!("{} note must have at least 2 choices", self.name)];
		}
		let Some(answer) = fields.get("Answer").filter(|a| !a.is_empty()) else {
			return Vec::new();
		};
		let max_choice = filled.iter().copied().max().unwrap_or(0);
		for part in answer.split(',').map(str::trim) {
			match part.parse::<usize>() {
				Ok(n) if n >= 1 && n <= max_choice => {}
				Ok(n) => {
					return vec![format!(
						"{} answer contains '{n}' but only {max_choice} choice(s) are provided",
						self.name
					)]
				}
				Err(_) => return vec![format!("{} answer must contain comma-separated integers", self.name)],
			}
		}
		Vec::new()
	}
}

trait EmptyCheck {
	fn is_none_or_empty(&self) -> bool;
}

impl EmptyCheck for Option<&str> {
	fn is_none_or_empty(&self) -> bool {
		self.map_or(true, |v| v.trim().is_empty())
	}
}

fn cloze_pattern() -> &'static Regex {
	static PATTERN: OnceLock<Regex> = OnceLock::new();
	PATTERN.get_or_init(|| Regex::new(r"\{\{c\d+::").expect("valid cloze pattern"))
}

/// Outcome of matching a field set against the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection<'a> {
	Managed(&'a NoteType),
	/// Fits one type only, but breaks its rules.
	Malformed { note_type: &'a NoteType, errors: Vec<String> },
	/// No type, or several, could claim the record.
	Unmanaged,
}

/// Built-in descriptors plus custom ones loaded at initialization.
#[derive(Debug, Clone)]
pub struct NoteTypeRegistry {
	types: Vec<NoteType>,
	prefixes: Vec<(String, String)>,
}

impl Default for NoteTypeRegistry {
	fn default() -> Self {
		NoteTypeRegistry::with_custom(Vec::new()).expect("built-in note types are consistent")
	}
}

impl NoteTypeRegistry {
	pub fn with_custom(custom: Vec<NoteType>) -> Result<Self, NoteTypeError> {
		let mut types = builtin_types();
		types.extend(custom);
		validate(&types)?;

		let mut by_prefix: HashMap<String, String> = HashMap::new();
		for t in &types {
			for f in &t.fields {
				by_prefix.entry(f.prefix.clone()).or_insert_with(|| f.name.clone());
			}
		}
		let mut prefixes: Vec<(String, String)> = by_prefix.into_iter().collect();
		// Longest first so `C10:` is tried before `C1:`.
		prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

		Ok(NoteTypeRegistry { types, prefixes })
	}

	pub fn get(&self, name: &str) -> Option<&NoteType> {
		self.types.iter().find(|t| t.name == name)
	}

	pub fn types(&self) -> &[NoteType] {
		&self.types
	}

	pub fn names(&self) -> Vec<&str> {
		self.types.iter().map(|t| t.name.as_str()).collect()
	}

	/// Match a line against the known prefixes: `(field name, rest of line)`.
	pub fn split_prefixed<'l>(&self, line: &'l str) -> Option<(&str, &'l str)> {
		for (prefix, field) in &self.prefixes {
			if line == prefix {
				return Some((field.as_str(), ""));
			}
			if let Some(rest) = line.strip_prefix(prefix.as_str()).and_then(|r| r.strip_prefix(' ')) {
				return Some((field.as_str(), rest));
			}
		}
		None
	}

	pub fn prefix_for(&self, note_type: &str, field: &str) -> Option<&str> {
		self.get(note_type)?.field(field).map(|f| f.prefix.as_str())
	}

	pub fn detect(&self, fields: &Fields) -> Detection<'_> {
		let present: BTreeSet<&str> = fields.iter().map(|(name, _)| name).collect();
		if present.is_empty() {
			return Detection::Unmanaged;
		}

		let candidates: Vec<&NoteType> = self.types.iter().filter(|t| t.accepts(&present)).collect();
		match candidates.as_slice() {
			[only] => {
				let errors = only.validate(fields);
				if errors.is_empty() {
					Detection::Managed(only)
				} else {
					Detection::Malformed { note_type: only, errors }
				}
			}
			[] => {
				let compatible: Vec<&NoteType> =
					self.types.iter().filter(|t| present.is_subset(&t.field_names())).collect();
				match compatible.as_slice() {
					[only] => Detection::Malformed {
						note_type: only,
						errors: only.validate(fields),
					},
					_ => Detection::Unmanaged,
				}
			}
			_ => Detection::Unmanaged,
		}
	}
}

fn common_fields() -> Vec<FieldSpec> {
	vec![
		FieldSpec::new("Extra", "E:", false),
		FieldSpec::new("More", "M:", false),
		FieldSpec::new("Source", "S:", false),
	]
}

fn builtin(name: &str, mut fields: Vec<FieldSpec>, kind: NoteKind) -> NoteType {
	fields.extend(common_fields());
	NoteType {
		name: name.to_string(),
		fields,
		kind,
		builtin: true,
	}
}

fn builtin_types() -> Vec<NoteType> {
	let mut choice = vec![FieldSpec::new("Question", "Q:", true)];
	for i in 1..=8 {
		choice.push(FieldSpec::new(&format!("Choice {i}"), &format!("C{i}:"), true));
	}
	choice.push(FieldSpec::new("Answer", "A:", true));

	vec![
		builtin(
			"CardSyncQA",
			vec![FieldSpec::new("Question", "Q:", true), FieldSpec::new("Answer", "A:", true)],
			NoteKind::Standard,
		),
		builtin(
			"CardSyncReversed",
			vec![FieldSpec::new("Front", "F:", true), FieldSpec::new("Back", "B:", true)],
			NoteKind::Standard,
		),
		builtin("CardSyncCloze", vec![FieldSpec::new("Text", "T:", true)], NoteKind::Cloze),
		builtin(
			"CardSyncInput",
			vec![FieldSpec::new("Question", "Q:", true), FieldSpec::new("Input", "I:", true)],
			NoteKind::Standard,
		),
		builtin("CardSyncChoice", choice, NoteKind::Choice),
	]
}

fn validate(types: &[NoteType]) -> Result<(), NoteTypeError> {
	let mut prefix_to_field: HashMap<&str, (&str, &str)> = HashMap::new();
	let mut builtin_prefixes: BTreeSet<&str> = BTreeSet::new();
	let mut names: BTreeSet<&str> = BTreeSet::new();

	for t in types {
		if !names.insert(t.name.as_str()) || (!t.builtin && t.name.starts_with(BUILTIN_PREFIX)) {
			return Err(NoteTypeError::ReservedName(t.name.clone()));
		}
		if t.builtin {
			builtin_prefixes.extend(t.identifying_prefixes());
		}
		for f in &t.fields {
			if f.name == KEY_FIELD {
				return Err(NoteTypeError::ReservedField(t.name.clone()));
			}
			match prefix_to_field.get(f.prefix.as_str()) {
				Some((existing, _)) if *existing != f.name => {
					return Err(NoteTypeError::InconsistentPrefix {
						prefix: f.prefix.clone(),
						existing: existing.to_string(),
						note_type: t.name.clone(),
						field: f.name.clone(),
					});
				}
				Some(_) => {}
				None => {
					prefix_to_field.insert(f.prefix.as_str(), (f.name.as_str(), t.name.as_str()));
				}
			}
		}
	}

	for t in types {
		if !t.builtin {
			if let Some(f) = t.fields.iter().find(|f| builtin_prefixes.contains(f.prefix.as_str())) {
				return Err(NoteTypeError::ReservedPrefix {
					note_type: t.name.clone(),
					prefix: f.prefix.clone(),
				});
			}
		}
		let ident = t.identifying_prefixes();
		if ident.is_empty() {
			return Err(NoteTypeError::NoIdentifyingField(t.name.clone()));
		}
		if let Some(other) = types.iter().find(|o| o.name != t.name && o.identifying_prefixes() == ident) {
			return Err(NoteTypeError::Ambiguous(t.name.clone(), other.name.clone()));
		}
		if t.kind == NoteKind::Choice && !t.fields.iter().any(FieldSpec::is_choice) {
			return Err(NoteTypeError::ChoiceWithoutChoices(t.name.clone()));
		}
	}
	Ok(())
}
