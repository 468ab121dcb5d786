use std::fmt;

use crate::models::{
	operation::{Direction, Locator, Side},
	record::ContentHash,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Conflict {
	/// The same key marker on more than one file-side record.
	DuplicateKey { key: String, locations: Vec<Locator> },
	/// Both sides changed since the recorded hash.
	Diverged {
		key: String,
		recorded: ContentHash,
		canonical: ContentHash,
		target: ContentHash,
	},
	/// The mapping binds a remote note to one key, its embedded marker names another.
	IdentityMismatch {
		remote_id: i64,
		mapped: String,
		embedded: String,
		/// The note's content matches what is recorded or held on the file side for the key.
		mapped_matches: bool,
		embedded_matches: bool,
	},
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
	/// Abort the pass before anything is changed.
	HardFail,
	Overwrite { winner: Side },
	Rebind { key: String },
	/// Skip every operation for the keys involved.
	FailOperation { reason: String },
}

/// Deterministic: the same conflict and direction always resolve the same way.
pub fn resolve(conflict: &Conflict, direction: Direction) -> Resolution {
	match conflict {
		Conflict::DuplicateKey { .. } => Resolution::HardFail,
		Conflict::Diverged { .. } => Resolution::Overwrite {
			winner: direction.canonical(),
		},
		Conflict::IdentityMismatch {
			mapped,
			embedded,
			mapped_matches,
			embedded_matches,
			..
		} => {
			if *mapped_matches {
				Resolution::Rebind { key: mapped.clone() }
			} else if *embedded_matches {
				Resolution::Rebind { key: embedded.clone() }
			} else {
				Resolution::FailOperation {
					reason: format!("cannot tell whether the note is '{mapped}' or '{embedded}'"),
				}
			}
		}
	}
}

impl fmt::Display for Conflict {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Conflict::DuplicateKey { key, locations } => {
				let at: Vec<String> = locations.iter().map(|l| l.to_string()).collect();
				write!(f, "key '{key}' appears {} times: {}", locations.len(), at.join(", "))
			}
			Conflict::Diverged { key, .. } => write!(f, "'{key}' changed on both sides since the last sync"),
			Conflict::IdentityMismatch {
				remote_id,
				mapped,
				embedded,
				..
			} => write!(f, "note {remote_id} is mapped to '{mapped}' but carries key '{embedded}'"),
		}
	}
}

impl fmt::Display for Resolution {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Resolution::HardFail => f.write_str("pass aborted"),
			Resolution::Overwrite { winner } => write!(f, "{winner} win"),
			Resolution::Rebind { key } => write!(f, "bound to '{key}'"),
			Resolution::FailOperation { reason } => write!(f, "skipped: {reason}"),
		}
	}
}
