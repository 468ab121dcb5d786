use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
	deck::DeckPath,
	note_type::{FieldSpec, NoteKind, NoteType, NoteTypeError, NoteTypeRegistry},
};

pub const CONFIG_FILE: &str = "cardsync.toml";

const DEFAULT_STORE: &str = ".cardsync.db";
const DEFAULT_URL: &str = "http://127.0.0.1:8765";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {reason}")]
	Read { path: String, reason: String },

	#[error("failed to parse {path}: {reason}")]
	Parse { path: String, reason: String },

	#[error("invalid note types in {path}: {source}")]
	NoteTypes {
		path: String,
		#[source]
		source: NoteTypeError,
	},

	#[error("invalid setting: {0}")]
	Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
	/// Mapping store location, relative to the collection directory.
	pub store: PathBuf,
	pub remote: RemoteConfig,
	pub scope: Scope,
	pub media: MediaConfig,
	pub note_types: Vec<NoteTypeConfig>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			store: PathBuf::from(DEFAULT_STORE),
			remote: RemoteConfig::default(),
			scope: Scope::default(),
			media: MediaConfig::default(),
			note_types: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MediaConfig {
	/// Copy referenced media along with the notes.
	pub enabled: bool,
}

impl Default for MediaConfig {
	fn default() -> Self {
		MediaConfig { enabled: true }
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
	pub url: String,
	pub timeout_secs: u64,
	pub max_concurrency: usize,
}

impl Default for RemoteConfig {
	fn default() -> Self {
		RemoteConfig {
			url: DEFAULT_URL.to_string(),
			timeout_secs: DEFAULT_TIMEOUT_SECS,
			max_concurrency: DEFAULT_MAX_CONCURRENCY,
		}
	}
}

impl RemoteConfig {
	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}
}

/// Top-level decks a pass covers. Subdecks follow their top-level deck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scope {
	/// Empty means every top-level deck.
	pub decks: Vec<String>,
	pub exclude: Vec<String>,
}

impl Default for Scope {
	fn default() -> Self {
		Scope {
			decks: Vec::new(),
			exclude: vec!["Default".to_string()],
		}
	}
}

impl Scope {
	pub fn contains(&self, deck: &DeckPath) -> bool {
		let top = deck.top_level();
		if self.exclude.iter().any(|e| e == top) {
			return false;
		}
		self.decks.is_empty() || self.decks.iter().any(|d| d == top)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoteTypeConfig {
	pub name: String,
	pub fields: Vec<FieldSpec>,
	#[serde(default)]
	pub is_cloze: bool,
	#[serde(default)]
	pub is_choice: bool,
}

impl NoteTypeConfig {
	fn to_note_type(&self) -> Result<NoteType, NoteTypeError> {
		let kind = match (self.is_cloze, self.is_choice) {
			(false, false) => NoteKind::Standard,
			(true, false) => NoteKind::Cloze,
			(false, true) => NoteKind::Choice,
			(true, true) => return Err(NoteTypeError::ConflictingKind(self.name.clone())),
		};
		Ok(NoteType::custom(&self.name, self.fields.clone(), kind))
	}
}

impl Config {
	/// Read `cardsync.toml` from `path`; a missing file yields defaults.
	pub fn load(path: &Path) -> Result<Config, ConfigError> {
		if !path.exists() {
			tracing::debug!("no config at {}, using defaults", path.display());
			return Ok(Config::default());
		}
		let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
			path: path.display().to_string(),
			reason: e.to_string(),
		})?;
		let config: Config = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
			path: path.display().to_string(),
			reason: e.to_string(),
		})?;
		config.validate()?;
		// Note type errors surface here, not at the first pass.
		config.registry().map_err(|source| ConfigError::NoteTypes {
			path: path.display().to_string(),
			source,
		})?;
		Ok(config)
	}

	pub fn load_for_collection(collection: &Path) -> Result<Config, ConfigError> {
		Config::load(&collection.join(CONFIG_FILE))
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.remote.max_concurrency == 0 {
			return Err(ConfigError::Invalid("remote.max_concurrency must be at least 1".into()));
		}
		if self.remote.timeout_secs == 0 {
			return Err(ConfigError::Invalid("remote.timeout_secs must be at least 1".into()));
		}
		for name in self.scope.decks.iter().chain(&self.scope.exclude) {
			DeckPath::parse(name).map_err(|e| ConfigError::Invalid(format!("scope: {e}")))?;
		}
		Ok(())
	}

	/// Built-in note types plus the custom ones declared here.
	pub fn registry(&self) -> Result<NoteTypeRegistry, NoteTypeError> {
		let custom = self
			.note_types
			.iter()
			.map(|c| c.to_note_type())
			.collect::<Result<Vec<_>, _>>()?;
		NoteTypeRegistry::with_custom(custom)
	}

	pub fn store_path(&self, collection: &Path) -> PathBuf {
		if self.store.is_absolute() {
			self.store.clone()
		} else {
			collection.join(&self.store)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_file_gives_defaults() {
		let tmp = tempfile::tempdir().unwrap();
		let config = Config::load_for_collection(tmp.path()).unwrap();
		assert_eq!(config, Config::default());
		assert_eq!(config.remote.max_concurrency, 4);
		assert_eq!(config.store_path(tmp.path()), tmp.path().join(".cardsync.db"));
	}

	#[test]
	fn parses_scope_and_custom_types() {
		let tmp = tempfile::tempdir().unwrap();
		fs::write(
			tmp.path().join(CONFIG_FILE),
			r#"
store = "state/map.db"

[remote]
url = "http://localhost:9999"
max_concurrency = 2

[scope]
decks = ["Biology"]

[media]
enabled = false

[[note_types]]
name = "Vocab"
fields = [
    { name = "Word", prefix = "W:", identifying = true },
    { name = "Meaning", prefix = "MN:", identifying = true },
]
"#,
		)
		.unwrap();

		let config = Config::load_for_collection(tmp.path()).unwrap();
		assert_eq!(config.remote.url, "http://localhost:9999");
		assert_eq!(config.remote.timeout_secs, 10);
		assert_eq!(config.scope.exclude, vec!["Default".to_string()]);
		assert!(config.scope.contains(&DeckPath::parse("Biology::Cells").unwrap()));
		assert!(!config.scope.contains(&DeckPath::parse("Chemistry").unwrap()));
		assert!(!config.media.enabled);

		let registry = config.registry().unwrap();
		assert!(registry.get("Vocab").is_some());
		assert!(registry.get("CardSyncQA").is_some());
	}

	#[test]
	fn rejects_invalid_custom_types() {
		let tmp = tempfile::tempdir().unwrap();
		fs::write(
			tmp.path().join(CONFIG_FILE),
			r#"
[[note_types]]
name = "Broken"
fields = [{ name = "Question", prefix = "Q:", identifying = true }]
"#,
		)
		.unwrap();
		assert!(matches!(
			Config::load_for_collection(tmp.path()),
			Err(ConfigError::NoteTypes { .. })
		));
	}

	#[test]
	fn default_scope_excludes_default_deck() {
		let scope = Scope::default();
		assert!(!scope.contains(&DeckPath::parse("Default").unwrap()));
		assert!(scope.contains(&DeckPath::parse("Anything").unwrap()));
		let all = Scope {
			decks: Vec::new(),
			exclude: Vec::new(),
		};
		assert!(all.contains(&DeckPath::parse("Default").unwrap()));
	}
}
