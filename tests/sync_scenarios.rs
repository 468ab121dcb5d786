use std::{fs, path::Path, sync::Arc};

use cardsync::{
	config::Config,
	engine::{Conflict, Finding, MappingStore, SyncEngine, SyncError},
	models::{
		note_type::KEY_FIELD,
		operation::{Direction, OpKind},
	},
	remote::{memory::Action, MemoryRemote, RemoteError},
};
use tempfile::TempDir;

fn write(root: &Path, name: &str, text: &str) {
	fs::write(root.join(name), text).unwrap();
}

fn read(root: &Path, name: &str) -> String {
	fs::read_to_string(root.join(name)).unwrap()
}

fn setup() -> (TempDir, Arc<MemoryRemote>) {
	(tempfile::tempdir().unwrap(), Arc::new(MemoryRemote::new()))
}

/// Engine with a volatile mapping store that lives as long as the engine.
fn engine(root: &Path, remote: &Arc<MemoryRemote>) -> SyncEngine<MemoryRemote> {
	SyncEngine::new(root, Config::default(), Arc::clone(remote))
		.unwrap()
		.with_store(MappingStore::in_memory())
}

/// Engine with the store on disk at its default place inside the collection.
fn disk_engine(root: &Path, remote: &Arc<MemoryRemote>) -> SyncEngine<MemoryRemote> {
	SyncEngine::new(root, Config::default(), Arc::clone(remote)).unwrap()
}

fn marker_keys(text: &str) -> Vec<String> {
	text.lines()
		.filter_map(cardsync::files::markdown::marker_key)
		.map(str::to_string)
		.collect()
}

#[tokio::test]
async fn fresh_import_creates_one_note_and_marks_the_file() {
	let (tmp, remote) = setup();
	write(tmp.path(), "Biology.md", "Q: What is ATP?\nA: Energy");
	let mut engine = engine(tmp.path(), &remote);

	let report = engine.run(Direction::Import).await.unwrap();

	assert_eq!(report.plan.summary().count(OpKind::Create), 1);
	assert!(!report.has_failures());
	let keys = marker_keys(&read(tmp.path(), "Biology.md"));
	assert_eq!(keys.len(), 1);
	let notes = remote.notes();
	assert_eq!(notes.len(), 1);
	assert_eq!(notes[0].embedded_key(), Some(keys[0].as_str()));
	let mapping = engine.mapping().await.unwrap();
	assert_eq!(mapping.note_count(), 1);
	assert_eq!(mapping.key_for_remote(notes[0].id), Some(keys[0].as_str()));

	let again = engine.plan_only(Direction::Import).await.unwrap();
	assert!(again.plan.is_empty(), "{:?}", again.plan.operations);
	let back = engine.plan_only(Direction::Export).await.unwrap();
	assert!(back.plan.is_empty(), "{:?}", back.plan.operations);
}

#[tokio::test]
async fn remote_deck_rename_is_followed_on_export() {
	let (tmp, remote) = setup();
	write(tmp.path(), "Biology.md", "Q: What is ATP?\nA: Energy\n\n---\n\nQ: What is DNA?\nA: Genes");
	let mut engine = engine(tmp.path(), &remote);
	engine.run(Direction::Import).await.unwrap();
	let synced = read(tmp.path(), "Biology.md");
	let ids: Vec<i64> = remote.notes().iter().map(|n| n.id).collect();

	remote.rename_deck_directly("Biology", "Biology::Advanced").unwrap();
	let report = engine.run(Direction::Export).await.unwrap();

	let summary = report.plan.summary();
	assert_eq!(summary.count(OpKind::DeckMove), 1);
	assert_eq!(summary.total(), 1, "{:?}", report.plan.operations);
	assert!(!tmp.path().join("Biology.md").exists());
	assert_eq!(read(tmp.path(), "Biology__Advanced.md"), synced);
	assert_eq!(remote.notes().iter().map(|n| n.id).collect::<Vec<_>>(), ids);
	assert_eq!(remote.deck_names(), vec!["Biology", "Biology::Advanced"]);

	let again = engine.plan_only(Direction::Export).await.unwrap();
	assert!(again.plan.is_empty(), "{:?}", again.plan.operations);
}

#[tokio::test]
async fn round_trip_lets_the_file_win_and_settles() {
	let (tmp, remote) = setup();
	write(tmp.path(), "Biology.md", "Q: What is ATP?\nA: Energy");
	let mut engine = engine(tmp.path(), &remote);
	engine.run(Direction::Import).await.unwrap();
	let id = remote.notes()[0].id;

	let text = read(tmp.path(), "Biology.md").replace("A: Energy", "A: Energy currency");
	write(tmp.path(), "Biology.md", &text);
	remote.set_field(id, "Answer", "Remote edit");

	let reports = engine.round_trip().await.unwrap();

	assert_eq!(reports.len(), 2);
	assert!(reports[0]
		.plan
		.conflicts
		.iter()
		.any(|(c, _)| matches!(c, Conflict::Diverged { .. })));
	assert_eq!(reports[0].plan.summary().count(OpKind::Update), 1);
	let note = remote.note(id).unwrap();
	assert!(note.fields.contains(&("Answer".to_string(), "Energy currency".to_string())));
	assert!(reports[1].plan.is_empty(), "{:?}", reports[1].plan.operations);
	assert_eq!(read(tmp.path(), "Biology.md"), text);
}

#[tokio::test]
async fn duplicate_markers_abort_before_any_change() {
	let (tmp, remote) = setup();
	write(
		tmp.path(),
		"Biology.md",
		"<!-- note_key: dup-1 -->\nQ: a\nA: b\n\n---\n\n<!-- note_key: dup-1 -->\nQ: c\nA: d",
	);
	let mut engine = disk_engine(tmp.path(), &remote);

	let err = engine.run(Direction::Import).await.unwrap_err();

	assert!(matches!(err, SyncError::DuplicateKey(ref c) if c.len() == 1), "{err}");
	assert_eq!(remote.mutations(), 0);
	assert!(!tmp.path().join(".cardsync.db").exists());
}

#[tokio::test]
async fn garbage_store_is_rebuilt_from_markers() {
	let (tmp, remote) = setup();
	write(tmp.path(), "Biology.md", "Q: What is ATP?\nA: Energy\n\n---\n\nQ: What is DNA?\nA: Genes");
	engine(tmp.path(), &remote).run(Direction::Import).await.unwrap();

	write(tmp.path(), ".cardsync.db", "\u{0}\u{1}garbage");
	let text = read(tmp.path(), "Biology.md");
	write(
		tmp.path(),
		"Biology.md",
		&format!(
			"{}\n\n---\n\n<!-- note_key: orphan-1 -->\nQ: Orphan\nA: lost\n\n---\n\nQ: Brand new\nA: fresh\n",
			text.trim_end()
		),
	);

	let mut engine = disk_engine(tmp.path(), &remote);
	let report = engine.run(Direction::Import).await.unwrap();

	let rebuild = report.rebuild.as_ref().expect("store should be rebuilt");
	assert_eq!(rebuild.moved_to.as_deref(), Some(tmp.path().join(".cardsync.db.corrupt").as_path()));
	assert_eq!(rebuild.matched, 2);
	assert_eq!(rebuild.unmatched, vec!["orphan-1".to_string()]);
	let summary = report.plan.summary();
	assert_eq!(summary.count(OpKind::Create), 2);
	assert_eq!(summary.count(OpKind::Update), 0);
	assert_eq!(summary.count(OpKind::Delete), 0);
	assert!(!report.has_failures());
	assert_eq!(remote.notes().len(), 4);
	assert!(remote.notes().iter().any(|n| n.embedded_key() == Some("orphan-1")));
	assert_eq!(engine.mapping().await.unwrap().note_count(), 4);
}

#[tokio::test]
async fn store_without_markers_is_unrecoverable() {
	let (tmp, remote) = setup();
	write(tmp.path(), "Biology.md", "Q: a\nA: b");
	write(tmp.path(), ".cardsync.db", "garbage");
	remote
		.add_note("Biology", "CardSyncQA", &[("Question", "a"), ("Answer", "b")])
		.unwrap();
	let mut engine = disk_engine(tmp.path(), &remote);

	let err = engine.run(Direction::Import).await.unwrap_err();

	assert!(matches!(err, SyncError::StoreUnrecoverable { .. }), "{err}");
	assert_eq!(remote.mutations(), 0);
	assert!(tmp.path().join(".cardsync.db").is_file());
}

#[tokio::test]
async fn failed_create_is_retried_next_pass_without_duplicates() {
	let (tmp, remote) = setup();
	write(tmp.path(), "Greek.md", "Q: Alpha\nA: 1\n\n---\n\nQ: Beta\nA: 2\n\n---\n\nQ: Gamma\nA: 3");
	remote.fail_next(Action::CreateRecord, Some("Beta"), 2, RemoteError::Unreachable("connection reset".into()));
	let mut engine = engine(tmp.path(), &remote);

	let first = engine.run(Direction::Import).await.unwrap();
	assert!(first.has_failures());
	assert_eq!(remote.notes().len(), 2);
	assert_eq!(engine.mapping().await.unwrap().note_count(), 2);

	let second = engine.run(Direction::Import).await.unwrap();
	assert!(!second.has_failures());
	assert_eq!(second.plan.summary().count(OpKind::Create), 1);
	assert_eq!(remote.notes().len(), 3);
	assert!(engine.plan_only(Direction::Import).await.unwrap().plan.is_empty());
}

#[tokio::test]
async fn moving_a_block_keeps_the_note_identity() {
	let (tmp, remote) = setup();
	write(tmp.path(), "Biology.md", "Q: Mitochondria\nA: Powerhouse");
	let mut engine = engine(tmp.path(), &remote);
	engine.run(Direction::Import).await.unwrap();
	let before = remote.notes()[0].clone();

	let block = read(tmp.path(), "Biology.md");
	write(tmp.path(), "Chemistry.md", &block);
	write(tmp.path(), "Biology.md", "");
	let report = engine.run(Direction::Import).await.unwrap();

	assert_eq!(report.plan.summary().count(OpKind::Move), 1);
	assert_eq!(report.plan.summary().count(OpKind::Create), 0);
	let notes = remote.notes();
	assert_eq!(notes.len(), 1);
	assert_eq!(notes[0].id, before.id);
	assert_eq!(notes[0].deck.name(), "Chemistry");
	assert_eq!(notes[0].embedded_key(), before.embedded_key());
}

#[tokio::test]
async fn export_writes_collection_notes_with_markers() {
	let (tmp, remote) = setup();
	let id = remote
		.add_note("Physics", "CardSyncQA", &[("Question", "F = ?"), ("Answer", "m &amp; a")])
		.unwrap();
	let mut engine = engine(tmp.path(), &remote);

	let report = engine.run(Direction::Export).await.unwrap();

	assert!(!report.has_failures());
	let text = read(tmp.path(), "Physics.md");
	let keys = marker_keys(&text);
	assert_eq!(keys.len(), 1);
	assert!(text.contains("Q: F = ?\nA: m & a"), "{text}");
	assert_eq!(remote.note(id).unwrap().embedded_key(), Some(keys[0].as_str()));
	assert!(engine.plan_only(Direction::Import).await.unwrap().plan.is_empty());
}

#[tokio::test]
async fn plan_only_changes_nothing() {
	let (tmp, remote) = setup();
	write(tmp.path(), "Biology.md", "Q: What is ATP?\nA: Energy");
	let mut engine = disk_engine(tmp.path(), &remote);

	let report = engine.plan_only(Direction::Import).await.unwrap();

	assert_eq!(report.plan.summary().count(OpKind::Create), 1);
	assert!(report.apply.is_none());
	assert_eq!(read(tmp.path(), "Biology.md"), "Q: What is ATP?\nA: Energy");
	assert_eq!(remote.mutations(), 0);
	assert!(!tmp.path().join(".cardsync.db").exists());
}

#[tokio::test]
async fn cancelled_engine_does_nothing() {
	let (tmp, remote) = setup();
	write(tmp.path(), "Biology.md", "Q: What is ATP?\nA: Energy");
	let mut engine = engine(tmp.path(), &remote);
	engine.cancel_flag().cancel();

	assert!(matches!(engine.run(Direction::Import).await, Err(SyncError::Cancelled)));
	assert_eq!(remote.mutations(), 0);
}

#[tokio::test]
async fn import_declares_note_types_before_creating_notes() {
	let (tmp, remote) = setup();
	remote.require_note_types();
	write(tmp.path(), "Biology.md", "Q: What is ATP?\nA: Energy\n\n---\n\nT: The {{c1::nucleus}} holds DNA");
	let mut engine = engine(tmp.path(), &remote);

	let report = engine.run(Direction::Import).await.unwrap();

	assert!(!report.has_failures(), "{}", report.headline());
	assert_eq!(remote.notes().len(), 2);
	let qa = remote.note_type_fields("CardSyncQA").unwrap();
	assert_eq!(qa.first().map(String::as_str), Some("Question"));
	assert_eq!(qa.last().map(String::as_str), Some(KEY_FIELD));
	assert!(remote.note_type_fields("CardSyncChoice").is_some());

	let before = remote.mutations();
	engine.run(Direction::Import).await.unwrap();
	assert_eq!(remote.mutations(), before);
}

#[tokio::test]
async fn note_type_setup_failure_names_the_type_and_creates_nothing() {
	let (tmp, remote) = setup();
	write(tmp.path(), "Biology.md", "T: The {{c1::nucleus}} holds DNA");
	remote.fail_next(
		Action::EnsureNoteType,
		Some("CardSyncCloze"),
		1,
		RemoteError::Rejected {
			action: "createModel".into(),
			reason: "collection is read-only".into(),
		},
	);
	let mut engine = engine(tmp.path(), &remote);

	let err = engine.run(Direction::Import).await.unwrap_err();

	assert!(matches!(err, SyncError::NoteTypeSetup { ref name, .. } if name == "CardSyncCloze"), "{err}");
	assert!(err.to_string().contains("CardSyncCloze"), "{err}");
	assert!(remote.notes().is_empty());
	assert!(marker_keys(&read(tmp.path(), "Biology.md")).is_empty());
}

#[tokio::test]
async fn custom_note_types_from_config_are_declared() {
	let (tmp, remote) = setup();
	remote.require_note_types();
	let config: Config = toml::from_str(
		r#"
		[[note_types]]
		name = "Vocab"
		fields = [
			{ name = "Word", prefix = "W:", identifying = true },
			{ name = "Meaning", prefix = "MN:", identifying = true },
		]
		"#,
	)
	.unwrap();
	write(tmp.path(), "Spanish.md", "W: perro\nMN: dog");
	let mut engine = SyncEngine::new(tmp.path(), config, Arc::clone(&remote))
		.unwrap()
		.with_store(MappingStore::in_memory());

	let report = engine.run(Direction::Import).await.unwrap();

	assert!(!report.has_failures(), "{}", report.headline());
	assert_eq!(
		remote.note_type_fields("Vocab").unwrap(),
		vec!["Word".to_string(), "Meaning".to_string(), KEY_FIELD.to_string()]
	);
	assert_eq!(remote.notes()[0].note_type, "Vocab");
}

#[tokio::test]
async fn note_deleted_in_the_collection_is_recreated_with_its_key() {
	let (tmp, remote) = setup();
	write(tmp.path(), "Biology.md", "Q: What is ATP?\nA: Energy");
	let mut engine = engine(tmp.path(), &remote);
	engine.run(Direction::Import).await.unwrap();
	let synced = read(tmp.path(), "Biology.md");
	let key = marker_keys(&synced).remove(0);
	let old_id = remote.notes()[0].id;

	remote.remove_note(old_id);
	let report = engine.run(Direction::Import).await.unwrap();

	assert!(report
		.findings
		.iter()
		.any(|f| matches!(f, Finding::StaleRecordMapping { key: k, remote_id } if *k == key && *remote_id == old_id)));
	assert_eq!(report.plan.summary().count(OpKind::Create), 1);
	assert!(!report.has_failures());
	let notes = remote.notes();
	assert_eq!(notes.len(), 1);
	assert_ne!(notes[0].id, old_id);
	assert_eq!(notes[0].embedded_key(), Some(key.as_str()));
	assert_eq!(read(tmp.path(), "Biology.md"), synced);
	let mapping = engine.mapping().await.unwrap();
	assert_eq!(mapping.key_for_remote(notes[0].id), Some(key.as_str()));
	assert!(engine.plan_only(Direction::Import).await.unwrap().plan.is_empty());
}

#[tokio::test]
async fn exported_values_with_prefix_lines_settle() {
	let (tmp, remote) = setup();
	remote
		.add_note(
			"Quiz",
			"CardSyncQA",
			&[("Question", "Which is right?<br>A: the first one<br>B: the second"), ("Answer", "A")],
		)
		.unwrap();
	let mut engine = engine(tmp.path(), &remote);

	let report = engine.run(Direction::Export).await.unwrap();
	assert!(!report.has_failures());
	let text = read(tmp.path(), "Quiz.md");
	assert!(text.contains("\\A: the first one"), "{text}");

	let import = engine.plan_only(Direction::Import).await.unwrap();
	assert!(import.plan.is_empty(), "{:?}", import.plan.operations);
	assert!(import.issues.is_empty(), "{:?}", import.issues);
	let export = engine.plan_only(Direction::Export).await.unwrap();
	assert!(export.plan.is_empty(), "{:?}", export.plan.operations);
}

#[tokio::test]
async fn import_pushes_hashed_media_and_notes_point_at_it() {
	let (tmp, remote) = setup();
	let app_media = tempfile::tempdir().unwrap();
	remote.set_media_dir(Some(app_media.path().to_path_buf()));
	fs::create_dir_all(tmp.path().join("media")).unwrap();
	fs::write(tmp.path().join("media/cell.png"), b"png bytes").unwrap();
	write(tmp.path(), "Biology.md", "Q: Label ![cell](media/cell.png)\nA: Nucleus");
	let mut engine = engine(tmp.path(), &remote);

	let report = engine.run(Direction::Import).await.unwrap();

	let media = report.media.as_ref().expect("media should be pushed");
	assert_eq!(media.renamed.len(), 1);
	let hashed = media.renamed[0].1.clone();
	assert!(hashed.starts_with("cell_") && hashed.ends_with(".png"), "{hashed}");
	assert_eq!(media.copied, vec![hashed.clone()]);
	assert!(app_media.path().join(&hashed).is_file());
	assert!(read(tmp.path(), "Biology.md").contains(&format!("media/{hashed}")));
	let question = remote.notes()[0].fields[0].1.clone();
	assert!(question.contains(&hashed), "{question}");

	let again = engine.run(Direction::Import).await.unwrap();
	assert!(again.plan.is_empty(), "{:?}", again.plan.operations);
	assert!(again.media.unwrap().copied.is_empty());
}

#[tokio::test]
async fn export_pulls_referenced_media() {
	let (tmp, remote) = setup();
	let app_media = tempfile::tempdir().unwrap();
	fs::write(app_media.path().join("ding.mp3"), b"mp3").unwrap();
	remote.set_media_dir(Some(app_media.path().to_path_buf()));
	remote
		.add_note("Music", "CardSyncQA", &[("Question", "Which note? [sound:ding.mp3]"), ("Answer", "A")])
		.unwrap();
	let mut engine = engine(tmp.path(), &remote);

	let report = engine.run(Direction::Export).await.unwrap();

	let media = report.media.as_ref().expect("media should be pulled");
	assert_eq!(media.copied, vec!["ding.mp3".to_string()]);
	assert_eq!(fs::read(tmp.path().join("media/ding.mp3")).unwrap(), b"mp3");
	assert!(engine.plan_only(Direction::Export).await.unwrap().media.is_none());
}
