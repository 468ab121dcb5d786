use std::{
	fs,
	io::{self, Write},
	path::Path,
};

use crate::files::CollectionError;

/// Write `contents` next to `path`, then rename over it.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), CollectionError> {
	let tmp = path.with_extension("md.tmp");
	let result = (|| -> io::Result<()> {
		let mut file = fs::File::create(&tmp)?;
		file.write_all(contents.as_bytes())?;
		file.sync_all()?;
		fs::rename(&tmp, path)
	})();
	result.map_err(|e| {
		let _ = fs::remove_file(&tmp);
		map_io_error(e, path)
	})
}

pub fn remove_file(path: &Path) -> Result<(), CollectionError> {
	match fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(map_io_error(e, path)),
	}
}

pub fn read_file(path: &Path) -> Result<String, CollectionError> {
	fs::read_to_string(path).map_err(|e| map_io_error(e, path))
}

pub fn map_io_error(err: io::Error, path: &Path) -> CollectionError {
	let path = path.display().to_string();
	match err.kind() {
		io::ErrorKind::PermissionDenied => CollectionError::PermissionDenied(path),
		_ => CollectionError::Io {
			path,
			reason: err.to_string(),
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn atomic_write_replaces_content() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("Deck.md");
		fs::write(&path, "old").unwrap();

		write_atomic(&path, "new").unwrap();

		assert_eq!(fs::read_to_string(&path).unwrap(), "new");
		assert!(!tmp.path().join("Deck.md.tmp").exists());
	}

	#[test]
	fn removing_missing_file_is_fine() {
		let tmp = tempfile::tempdir().unwrap();
		remove_file(&tmp.path().join("gone.md")).unwrap();
	}

	#[test]
	fn write_into_missing_dir_errors() {
		let tmp = tempfile::tempdir().unwrap();
		let err = write_atomic(&tmp.path().join("nope/Deck.md"), "x").unwrap_err();
		assert!(matches!(err, CollectionError::Io { .. }));
	}
}
