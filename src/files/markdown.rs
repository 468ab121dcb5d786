use std::sync::OnceLock;

use regex::Regex;

use crate::models::{note_type::NoteTypeRegistry, record::Record};

/// Separator between note blocks inside a deck file.
pub const NOTE_SEPARATOR: &str = "\n\n---\n\n";

fn key_marker() -> &'static Regex {
	static PATTERN: OnceLock<Regex> = OnceLock::new();
	PATTERN.get_or_init(|| Regex::new(r"^<!--\s*note_key:\s*([a-zA-Z0-9-]+)\s*-->\s*$").expect("valid marker pattern"))
}

fn code_fence() -> &'static Regex {
	static PATTERN: OnceLock<Regex> = OnceLock::new();
	PATTERN.get_or_init(|| Regex::new(r"^(```|~~~)").expect("valid fence pattern"))
}

pub fn marker_line(key: &str) -> String {
	format!("<!-- note_key: {key} -->")
}

/// Key of a marker line, if `line` is one.
pub fn marker_key(line: &str) -> Option<&str> {
	key_marker().captures(line).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// True if `line`, with any leading backslashes removed, would read as a field
/// prefix or a key marker.
fn looks_structural(line: &str, registry: &NoteTypeRegistry) -> bool {
	let bare = line.trim_start_matches('\\');
	registry.split_prefixed(bare).is_some() || marker_key(bare).is_some()
}

/// A backslash in front of a structural-looking line keeps it inside the value.
fn escape_line(line: &str, registry: &NoteTypeRegistry) -> String {
	if looks_structural(line, registry) {
		format!("\\{line}")
	} else {
		line.to_string()
	}
}

fn unescape_line<'l>(line: &'l str, registry: &NoteTypeRegistry) -> &'l str {
	match line.strip_prefix('\\') {
		Some(rest) if looks_structural(line, registry) => rest,
		_ => line,
	}
}

/// What a single block of a deck file holds.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedBlock {
	/// At least one known field prefix.
	Note(ParsedNote),
	/// A field prefix repeats; the block cannot be read reliably.
	Invalid { key: Option<String>, reason: String },
	/// Free text, blank or separator-only content.
	Unmanaged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNote {
	pub key: Option<String>,
	/// Raw `(field, value)` pairs in the order they appear, empty values kept.
	pub fields: Vec<(String, String)>,
	/// Lines before the first field, kept when the block is rewritten.
	pub preamble: Option<String>,
}

pub fn split_blocks(text: &str) -> Vec<String> {
	let body = text.trim_end();
	if body.trim().is_empty() {
		return Vec::new();
	}
	body.split(NOTE_SEPARATOR).map(str::to_string).collect()
}

pub fn join_blocks<'a>(blocks: impl IntoIterator<Item = &'a str>) -> String {
	let mut out = blocks.into_iter().collect::<Vec<_>>().join(NOTE_SEPARATOR);
	if !out.is_empty() {
		out.push('\n');
	}
	out
}

pub fn parse_block(raw: &str, registry: &NoteTypeRegistry) -> ParsedBlock {
	let trimmed = raw.trim();
	if trimmed.is_empty() || trimmed.chars().all(|c| c == '-') {
		return ParsedBlock::Unmanaged;
	}

	let mut key = None;
	let mut fields: Vec<(String, String)> = Vec::new();
	let mut current: Option<(String, Vec<&str>)> = None;
	let mut preamble: Vec<&str> = Vec::new();
	let mut in_fence = false;

	for line in trimmed.lines() {
		if code_fence().is_match(line.trim_start()) {
			in_fence = !in_fence;
			match current.as_mut() {
				Some((_, content)) => content.push(line),
				None => preamble.push(line),
			}
			continue;
		}
		if !in_fence {
			if let Some(caps) = key_marker().captures(line) {
				key = Some(caps[1].to_string());
				continue;
			}
			if let Some((field, rest)) = registry.split_prefixed(line) {
				if fields.iter().any(|(n, _)| n == field) || current.as_ref().is_some_and(|(n, _)| n == field) {
					return ParsedBlock::Invalid {
						key,
						reason: format!("duplicate field '{field}'"),
					};
				}
				if let Some((name, content)) = current.take() {
					fields.push((name, content.join("\n").trim().to_string()));
				}
				let first = if rest.is_empty() { Vec::new() } else { vec![rest] };
				current = Some((field.to_string(), first));
				continue;
			}
		}
		match current.as_mut() {
			Some((_, content)) if !in_fence => content.push(unescape_line(line, registry)),
			Some((_, content)) => content.push(line),
			None => preamble.push(line),
		}
	}
	if let Some((name, content)) = current.take() {
		fields.push((name, content.join("\n").trim().to_string()));
	}

	if fields.is_empty() {
		return ParsedBlock::Unmanaged;
	}
	let preamble = preamble.join("\n").trim().to_string();
	ParsedBlock::Note(ParsedNote {
		key,
		fields,
		preamble: (!preamble.is_empty()).then_some(preamble),
	})
}

/// Block text for a record: marker, preamble, then one prefixed line per field.
pub fn render_block(record: &Record, preamble: Option<&str>, registry: &NoteTypeRegistry) -> String {
	let mut lines: Vec<String> = Vec::new();
	if let Some(key) = &record.key {
		lines.push(marker_line(key));
	}
	if let Some(pre) = preamble {
		lines.push(pre.to_string());
	}
	let mut in_fence = lines.iter().filter(|l| code_fence().is_match(l.trim_start())).count() % 2 == 1;
	for (name, value) in record.fields.iter() {
		let prefix = registry.prefix_for(&record.note_type, name).unwrap_or(name);
		let mut value_lines = value.lines();
		match value_lines.next() {
			Some(first) => lines.push(format!("{prefix} {first}")),
			None => lines.push(prefix.to_string()),
		}
		for line in value_lines {
			if code_fence().is_match(line.trim_start()) {
				in_fence = !in_fence;
				lines.push(line.to_string());
			} else if in_fence {
				lines.push(line.to_string());
			} else {
				lines.push(escape_line(line, registry));
			}
		}
	}
	lines.join("\n")
}

/// Put a key marker on top of an existing block, leaving the rest untouched.
pub fn insert_marker(raw: &str, key: &str) -> String {
	let leading = raw.len() - raw.trim_start_matches('\n').len();
	let (head, body) = raw.split_at(leading);
	let mut out = String::with_capacity(raw.len() + key.len() + 20);
	out.push_str(head);
	out.push_str(&marker_line(key));
	out.push('\n');
	out.push_str(body);
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::models::{
		deck::DeckPath,
		note_type::Detection,
		record::{Fields, Origin},
	};

	fn registry() -> NoteTypeRegistry {
		NoteTypeRegistry::default()
	}

	fn note(block: ParsedBlock) -> ParsedNote {
		match block {
			ParsedBlock::Note(n) => n,
			other => panic!("expected note, got {other:?}"),
		}
	}

	#[test]
	fn parses_marker_and_multiline_fields() {
		let raw = "<!-- note_key: 01HX-abc -->\nQ: What is\nthe powerhouse?\nA: Mitochondria\nE:";
		let n = note(parse_block(raw, &registry()));
		assert_eq!(n.key.as_deref(), Some("01HX-abc"));
		assert_eq!(
			n.fields,
			vec![
				("Question".to_string(), "What is\nthe powerhouse?".to_string()),
				("Answer".to_string(), "Mitochondria".to_string()),
				("Extra".to_string(), String::new()),
			]
		);
	}

	#[test]
	fn code_fences_hide_prefixes() {
		let raw = "Q: Show code\nA: Like this\n```\nQ: not a field\n```";
		let n = note(parse_block(raw, &registry()));
		assert_eq!(n.fields.len(), 2);
		assert_eq!(n.fields[1].1, "Like this\n```\nQ: not a field\n```");
	}

	#[test]
	fn duplicate_prefix_is_invalid() {
		let raw = "<!-- note_key: k1 -->\nQ: one\nQ: two\nA: x";
		assert!(matches!(
			parse_block(raw, &registry()),
			ParsedBlock::Invalid { key: Some(k), .. } if k == "k1"
		));
	}

	#[test]
	fn free_text_is_unmanaged() {
		assert_eq!(parse_block("# Notes\nJust prose.", &registry()), ParsedBlock::Unmanaged);
		assert_eq!(parse_block("  \n", &registry()), ParsedBlock::Unmanaged);
		assert_eq!(parse_block("---", &registry()), ParsedBlock::Unmanaged);
	}

	#[test]
	fn preamble_is_kept_apart() {
		let n = note(parse_block("## Heading\nQ: q\nA: a", &registry()));
		assert_eq!(n.preamble.as_deref(), Some("## Heading"));
	}

	#[test]
	fn rendered_block_parses_back() {
		let reg = registry();
		let qa = reg.get("CardSyncQA").unwrap();
		let fields = Fields::from_pairs(vec![
			("Question".to_string(), "Line 1\nLine 2".to_string()),
			("Answer".to_string(), "Yes".to_string()),
		])
		.normalized(qa);
		let record = Record::new(
			Some("K1".into()),
			"CardSyncQA",
			fields.clone(),
			DeckPath::parse("Deck").unwrap(),
			Origin::File { ordinal: 0 },
		);
		let text = render_block(&record, None, &reg);
		assert_eq!(text, "<!-- note_key: K1 -->\nQ: Line 1\nLine 2\nA: Yes");

		let n = note(parse_block(&text, &reg));
		let parsed = Fields::from_pairs(n.fields);
		assert!(matches!(reg.detect(&parsed), Detection::Managed(t) if t.name == "CardSyncQA"));
		assert_eq!(parsed.normalized(qa), fields);
	}

	#[test]
	fn prefix_lines_inside_values_survive_a_rewrite() {
		let reg = registry();
		let qa = reg.get("CardSyncQA").unwrap();
		let question = "Which is right?\nA: the first one\n\\Q: escaped already\n<!-- note_key: not-a-key -->\n```\nA: in code\n```";
		let fields = Fields::from_pairs(vec![
			("Question".to_string(), question.to_string()),
			("Answer".to_string(), "yes\nE:".to_string()),
		])
		.normalized(qa);
		let record = Record::new(
			Some("K1".into()),
			"CardSyncQA",
			fields.clone(),
			DeckPath::parse("Deck").unwrap(),
			Origin::File { ordinal: 0 },
		);

		let text = render_block(&record, None, &reg);
		assert!(text.contains("\n\\A: the first one\n"), "{text}");
		assert!(text.contains("\n\\\\Q: escaped already\n"), "{text}");
		assert!(text.contains("\nA: in code\n"), "{text}");

		let n = note(parse_block(&text, &reg));
		assert_eq!(n.key.as_deref(), Some("K1"));
		assert_eq!(Fields::from_pairs(n.fields).normalized(qa), fields);
	}

	#[test]
	fn plain_backslash_lines_are_left_alone() {
		let n = note(parse_block("Q: path\n\\server\\share\nA: a", &registry()));
		assert_eq!(n.fields[0].1, "path\n\\server\\share");
	}

	#[test]
	fn marker_insertion_is_minimal() {
		assert_eq!(insert_marker("Q: q\nA: a", "K"), "<!-- note_key: K -->\nQ: q\nA: a");
		assert_eq!(insert_marker("\nQ: q", "K"), "\n<!-- note_key: K -->\nQ: q");
	}

	#[test]
	fn split_and_join() {
		let text = "Q: a\nA: b\n\n---\n\nQ: c\nA: d\n";
		let blocks = split_blocks(text);
		assert_eq!(blocks.len(), 2);
		assert_eq!(join_blocks(blocks.iter().map(String::as_str)), text);
		assert!(split_blocks("\n\n").is_empty());
	}
}
