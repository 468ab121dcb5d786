//! Media files referenced from deck files, kept in `media/` beside them.
//!
//! Import pushes referenced files into the collection's media folder, first
//! renaming each to carry a content hash so different files never share a
//! name there. Export pulls referenced files the other way.

use std::{
	collections::{BTreeMap, BTreeSet},
	fs,
	path::{Path, PathBuf},
	sync::OnceLock,
};

use regex::{Captures, Regex};

use crate::files::{scanner, writer, CollectionError};

pub const MEDIA_DIR: &str = "media";

const HASH_LEN: usize = 8;

// Image targets, <img> sources and sound tags; the middle group is the target.
fn reference_pattern() -> &'static Regex {
	static PATTERN: OnceLock<Regex> = OnceLock::new();
	PATTERN.get_or_init(|| {
		Regex::new(r#"(!\[[^\]]*\]\()([^)]+?)(\))|(<img[^>]+src=["'])([^"']+)(["'])|(\[sound:)([^\]]+)(\])"#)
			.expect("valid media pattern")
	})
}

/// File name a reference target points at. URLs and nested paths are not media.
pub fn media_name(target: &str) -> Option<&str> {
	let target = target.trim().trim_start_matches('<').trim_end_matches('>');
	let name = target.strip_prefix("media/").unwrap_or(target);
	let external = name.contains("://") || name.starts_with("data:");
	if name.is_empty() || external || name.contains(['/', '\\']) || name.starts_with('.') {
		return None;
	}
	Some(name)
}

fn target_of<'t>(caps: &Captures<'t>) -> Option<(usize, regex::Match<'t>)> {
	[2, 5, 8].into_iter().find_map(|i| caps.get(i).map(|m| (i, m)))
}

/// Media file names referenced in `text`.
pub fn references(text: &str) -> BTreeSet<String> {
	reference_pattern()
		.captures_iter(text)
		.filter_map(|caps| target_of(&caps))
		.filter_map(|(_, m)| media_name(m.as_str()))
		.map(str::to_string)
		.collect()
}

/// Point references at new names. Returns `None` when nothing changed.
pub fn rewrite_references(text: &str, renames: &BTreeMap<String, String>) -> Option<String> {
	let mut changed = false;
	let out = reference_pattern().replace_all(text, |caps: &Captures<'_>| {
		let Some((i, target)) = target_of(caps) else {
			return caps[0].to_string();
		};
		let Some((old, new)) = media_name(target.as_str()).and_then(|n| renames.get_key_value(n)) else {
			return caps[0].to_string();
		};
		changed = true;
		format!("{}{}{}", &caps[i - 1], target.as_str().replacen(old.as_str(), new, 1), &caps[i + 1])
	});
	changed.then(|| out.into_owned())
}

fn content_hash(bytes: &[u8]) -> String {
	let hex = blake3::hash(bytes).to_hex();
	hex[..HASH_LEN].to_string()
}

fn is_hash(s: &str) -> bool {
	s.len() == HASH_LEN && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// `name` with `hash` appended to its stem, replacing an older hash suffix.
fn hashed_name(name: &str, hash: &str) -> String {
	let (stem, ext) = match name.rsplit_once('.') {
		Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
		_ => (name, None),
	};
	let stem = match stem.rsplit_once('_') {
		Some((base, old)) if is_hash(old) => base,
		_ => stem,
	};
	match ext {
		Some(ext) => format!("{stem}_{hash}.{ext}"),
		None => format!("{stem}_{hash}"),
	}
}

/// Names starting with `_` are shared assets: never renamed, always pushed.
fn is_shared(name: &str) -> bool {
	name.starts_with('_')
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaReport {
	/// Local files renamed to their content-hashed name, old name first.
	pub renamed: Vec<(String, String)>,
	/// Deck files whose references were rewritten after renames.
	pub files_rewritten: usize,
	/// Files copied to the other side.
	pub copied: Vec<String>,
	/// Referenced files the source side does not have.
	pub missing: Vec<String>,
	/// Local media that no deck file refers to. Left in place.
	pub unreferenced: Vec<String>,
	pub errors: Vec<String>,
}

impl MediaReport {
	pub fn format(&self) -> String {
		format!(
			"{} copied, {} renamed, {} missing, {} unreferenced, {} errors",
			self.copied.len(),
			self.renamed.len(),
			self.missing.len(),
			self.unreferenced.len(),
			self.errors.len()
		)
	}

	fn error(&mut self, message: String) {
		tracing::warn!("{message}");
		self.errors.push(message);
	}
}

/// The local media folder of a collection directory and the application's.
#[derive(Debug, Clone)]
pub struct MediaFolders {
	root: PathBuf,
	local: PathBuf,
	remote: PathBuf,
}

fn resolved(path: &Path) -> PathBuf {
	fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl MediaFolders {
	pub fn new(root: &Path, remote: PathBuf) -> Result<Self, CollectionError> {
		let local = root.join(MEDIA_DIR);
		if resolved(&local) == resolved(&remote) {
			return Err(CollectionError::MediaAliased(local.display().to_string()));
		}
		Ok(MediaFolders {
			root: root.to_path_buf(),
			local,
			remote,
		})
	}

	pub fn local(&self) -> &Path {
		&self.local
	}

	/// Every media name referenced by any deck file, in scope or not.
	fn referenced(&self) -> Result<BTreeSet<String>, CollectionError> {
		let (entries, _) = scanner::walk_collection(&self.root)?;
		let mut names = BTreeSet::new();
		for entry in entries {
			names.extend(references(&writer::read_file(&entry.path)?));
		}
		Ok(names)
	}

	/// Hash-rename referenced local files, then copy what the application lacks.
	pub fn push(&self) -> Result<MediaReport, CollectionError> {
		let mut report = MediaReport::default();
		let referenced = self.referenced()?;

		let mut renames = BTreeMap::new();
		for name in &referenced {
			let path = self.local.join(name);
			if !path.is_file() {
				if !self.remote.join(name).is_file() {
					report.missing.push(name.clone());
				}
				continue;
			}
			if is_shared(name) {
				continue;
			}
			match self.hash_rename(name) {
				Ok(Some(new)) => {
					renames.insert(name.clone(), new);
				}
				Ok(None) => {}
				Err(e) => report.error(format!("could not hash {}: {e}", path.display())),
			}
		}
		if !renames.is_empty() {
			report.files_rewritten = self.rewrite_deck_files(&renames)?;
			report.renamed = renames.iter().map(|(o, n)| (o.clone(), n.clone())).collect();
		}

		let referenced: BTreeSet<String> = referenced
			.into_iter()
			.map(|name| renames.get(&name).cloned().unwrap_or(name))
			.collect();
		for name in self.local_files(&mut report) {
			if !referenced.contains(&name) && !is_shared(&name) {
				report.unreferenced.push(name);
				continue;
			}
			let target = self.remote.join(&name);
			if target.exists() {
				continue;
			}
			match fs::copy(self.local.join(&name), &target) {
				Ok(_) => report.copied.push(name),
				Err(e) => report.error(format!("could not copy {name} to {}: {e}", self.remote.display())),
			}
		}
		for name in &report.missing {
			tracing::warn!("referenced media {name} is in neither media folder");
		}
		Ok(report)
	}

	/// Copy referenced files the local folder lacks from the application.
	pub fn pull(&self) -> Result<MediaReport, CollectionError> {
		let mut report = MediaReport::default();
		let referenced = self.referenced()?;
		if referenced.is_empty() {
			return Ok(report);
		}
		if let Err(e) = fs::create_dir_all(&self.local) {
			return Err(writer::map_io_error(e, &self.local));
		}
		for name in referenced {
			let target = self.local.join(&name);
			if target.exists() {
				continue;
			}
			let source = self.remote.join(&name);
			if !source.is_file() {
				tracing::warn!("referenced media {name} not found in {}", self.remote.display());
				report.missing.push(name);
				continue;
			}
			match fs::copy(&source, &target) {
				Ok(_) => report.copied.push(name),
				Err(e) => report.error(format!("could not copy {name} from {}: {e}", self.remote.display())),
			}
		}
		Ok(report)
	}

	/// Rename `name` to its hashed form. A same-content file already there wins.
	fn hash_rename(&self, name: &str) -> std::io::Result<Option<String>> {
		let path = self.local.join(name);
		let hash = content_hash(&fs::read(&path)?);
		let new = hashed_name(name, &hash);
		if new == name {
			return Ok(None);
		}
		let target = self.local.join(&new);
		if target.exists() {
			if content_hash(&fs::read(&target)?) != hash {
				tracing::warn!("not renaming {name}: {new} exists with other content");
				return Ok(None);
			}
			fs::remove_file(&path)?;
		} else {
			fs::rename(&path, &target)?;
		}
		tracing::debug!("renamed media {name} to {new}");
		Ok(Some(new))
	}

	fn rewrite_deck_files(&self, renames: &BTreeMap<String, String>) -> Result<usize, CollectionError> {
		let (entries, _) = scanner::walk_collection(&self.root)?;
		let mut rewritten = 0;
		for entry in entries {
			let text = writer::read_file(&entry.path)?;
			if let Some(new) = rewrite_references(&text, renames) {
				writer::write_atomic(&entry.path, &new)?;
				rewritten += 1;
			}
		}
		Ok(rewritten)
	}

	/// Plain files in the local folder, dotfiles left out.
	fn local_files(&self, report: &mut MediaReport) -> Vec<String> {
		let dir = match fs::read_dir(&self.local) {
			Ok(dir) => dir,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
			Err(e) => {
				report.error(format!("could not list {}: {e}", self.local.display()));
				return Vec::new();
			}
		};
		let mut names: Vec<String> = dir
			.filter_map(Result::ok)
			.filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
			.filter_map(|e| e.file_name().into_string().ok())
			.filter(|n| !n.starts_with('.'))
			.collect();
		names.sort();
		names
	}
}
