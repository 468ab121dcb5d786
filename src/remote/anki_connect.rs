use std::{collections::HashMap, path::PathBuf, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
	models::{
		deck::DeckPath,
		note_type::{NoteKind, NoteType},
	},
	remote::{NewRemoteRecord, NoteTypeChange, RemoteDeck, RemoteError, RemoteRecord, RemoteStore},
};

const API_VERSION: u8 = 6;

const CARD_CSS: &str = ".card { font-family: sans-serif; font-size: 20px; text-align: left; }\n\
.extra { margin-top: 1em; color: #555; font-size: 16px; }\n";

/// Built-in type that yields a card per direction.
const REVERSED_TYPE: &str = "CardSyncReversed";

#[derive(Debug, Serialize, Deserialize)]
struct ApiResponse {
	result: Option<Value>,
	error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Field {
	value: String,
	order: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct NoteInfo {
	note_id: i64,
	fields: HashMap<String, Field>,
	model_name: String,
	#[serde(default)]
	cards: Vec<i64>,
}

/// HTTP client for the AnkiConnect add-on.
#[derive(Debug, Clone)]
pub struct AnkiConnect {
	client: Client,
	url: String,
	timeout: Duration,
}

impl AnkiConnect {
	pub fn new(url: &str, timeout: Duration) -> Result<Self, RemoteError> {
		let client = Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| RemoteError::Unreachable(e.to_string()))?;
		Ok(AnkiConnect {
			client,
			url: url.to_string(),
			timeout,
		})
	}

	async fn make_request(&self, action: &str, params: Option<Value>) -> Result<Value, RemoteError> {
		let mut body = serde_json::Map::new();
		body.insert("action".to_string(), Value::String(action.to_string()));
		body.insert("version".to_string(), Value::Number(API_VERSION.into()));
		if let Some(params) = params {
			body.insert("params".to_string(), params);
		}

		let response = self
			.client
			.post(&self.url)
			.json(&body)
			.send()
			.await
			.map_err(|e| self.map_transport_error(action, e))?;
		let response: ApiResponse = response.json().await.map_err(|e| RemoteError::Decode {
			action: action.to_string(),
			reason: e.to_string(),
		})?;

		if let Some(error) = response.error {
			return Err(RemoteError::Rejected {
				action: action.to_string(),
				reason: error,
			});
		}
		Ok(response.result.unwrap_or(Value::Null))
	}

	async fn request<T: DeserializeOwned>(&self, action: &str, params: Option<Value>) -> Result<T, RemoteError> {
		let value = self.make_request(action, params).await?;
		serde_json::from_value(value).map_err(|e| RemoteError::Decode {
			action: action.to_string(),
			reason: e.to_string(),
		})
	}

	fn map_transport_error(&self, action: &str, err: reqwest::Error) -> RemoteError {
		if err.is_timeout() {
			RemoteError::Timeout {
				action: action.to_string(),
				secs: self.timeout.as_secs(),
			}
		} else {
			RemoteError::Unreachable(format!("{}: {err}", self.url))
		}
	}

	async fn deck_names_and_ids(&self) -> Result<HashMap<String, i64>, RemoteError> {
		self.request("deckNamesAndIds", None).await
	}

	async fn deck_name(&self, id: i64) -> Result<String, RemoteError> {
		self.deck_names_and_ids()
			.await?
			.into_iter()
			.find(|(_, deck_id)| *deck_id == id)
			.map(|(name, _)| name)
			.ok_or_else(|| RemoteError::NotFound(format!("deck {id}")))
	}

	async fn notes_info(&self, ids: Vec<i64>) -> Result<Vec<NoteInfo>, RemoteError> {
		if ids.is_empty() {
			return Ok(Vec::new());
		}
		self.request("notesInfo", Some(json!({ "notes": ids }))).await
	}

	async fn cards_directly_in(&self, deck: &str) -> Result<Vec<i64>, RemoteError> {
		self.request("findCards", Some(json!({ "query": deck_query(deck) }))).await
	}

	async fn change_deck(&self, cards: Vec<i64>, deck: &str) -> Result<(), RemoteError> {
		if cards.is_empty() {
			return Ok(());
		}
		self.make_request("changeDeck", Some(json!({ "cards": cards, "deck": deck })))
			.await
			.map(|_| ())
	}
}

/// Search for cards in `deck` but not in its subdecks.
fn deck_query(deck: &str) -> String {
	let escaped = escape_search(deck);
	format!("deck:\"{escaped}\" -deck:\"{escaped}::*\"")
}

// `*` and `_` are wildcards in the collection's search syntax.
fn escape_search(text: &str) -> String {
	let mut out = String::with_capacity(text.len());
	for c in text.chars() {
		if matches!(c, '\\' | '"' | '*' | '_') {
			out.push('\\');
		}
		out.push(c);
	}
	out
}

/// Old decks left empty by renaming `from` into its own subtree, deepest first.
/// `from` itself and the ancestors of `to` still hold the new tree.
fn emptied_subdecks(subtree: &[DeckPath], from: &DeckPath, to: &DeckPath) -> Vec<DeckPath> {
	let mut doomed: Vec<DeckPath> = subtree
		.iter()
		.filter(|old| *old != from && !to.starts_with(old) && !old.starts_with(to))
		.cloned()
		.collect();
	doomed.sort_by(|a, b| b.depth().cmp(&a.depth()).then_with(|| a.cmp(b)));
	doomed
}

/// Front and back templates for a new model. The first identifying field and any
/// choices make the front. Optional fields show on the back when filled.
fn card_templates(note_type: &NoteType) -> Value {
	let show = |name: &str| format!("{{{{#{name}}}}}<div class=\"extra\">{{{{{name}}}}}</div>{{{{/{name}}}}}");
	let extras: String = note_type
		.fields
		.iter()
		.filter(|f| !f.identifying)
		.map(|f| show(&f.name))
		.collect();
	let identifying: Vec<&str> = note_type
		.fields
		.iter()
		.filter(|f| f.identifying)
		.map(|f| f.name.as_str())
		.collect();

	if note_type.kind == NoteKind::Cloze {
		let text = identifying.first().copied().unwrap_or("Text");
		return json!([{
			"Name": "Cloze",
			"Front": format!("{{{{cloze:{text}}}}}"),
			"Back": format!("{{{{cloze:{text}}}}}{extras}"),
		}]);
	}

	let (front, rest) = match identifying.split_first() {
		Some((front, rest)) => (*front, rest),
		None => ("Front", &[][..]),
	};
	let is_choice = |name: &str| note_type.kind == NoteKind::Choice && name.contains("Choice");
	let choices: String = rest.iter().copied().filter(|n| is_choice(*n)).map(|n| show(n)).collect();
	let answer: String = rest
		.iter()
		.copied()
		.filter(|n| !is_choice(*n))
		.map(|name| {
			if name == "Input" {
				"{{type:Input}}".to_string()
			} else {
				format!("<div>{{{{{name}}}}}</div>")
			}
		})
		.collect();
	let mut templates = vec![json!({
		"Name": "Card 1",
		"Front": format!("{{{{{front}}}}}{choices}"),
		"Back": format!("{{{{FrontSide}}}}<hr id=answer>{answer}{extras}"),
	})];
	if note_type.name == REVERSED_TYPE {
		if let Some(back) = rest.first() {
			templates.push(json!({
				"Name": "Card 2",
				"Front": format!("{{{{{back}}}}}"),
				"Back": format!("{{{{FrontSide}}}}<hr id=answer><div>{{{{{front}}}}}</div>{extras}"),
			}));
		}
	}
	Value::Array(templates)
}

fn fields_object(fields: &[(String, String)]) -> Value {
	let map: serde_json::Map<String, Value> =
		fields.iter().map(|(n, v)| (n.clone(), Value::String(v.clone()))).collect();
	Value::Object(map)
}

#[async_trait]
impl RemoteStore for AnkiConnect {
	async fn list_decks(&self) -> Result<Vec<RemoteDeck>, RemoteError> {
		let mut decks = Vec::new();
		for (name, id) in self.deck_names_and_ids().await? {
			match DeckPath::parse(&name) {
				Ok(path) => decks.push(RemoteDeck { id, path }),
				Err(e) => tracing::warn!("ignoring deck {id}: {e}"),
			}
		}
		decks.sort_by(|a, b| a.path.cmp(&b.path));
		Ok(decks)
	}

	async fn list_records_in_deck(&self, deck: &RemoteDeck) -> Result<Vec<RemoteRecord>, RemoteError> {
		let ids: Vec<i64> = self
			.request("findNotes", Some(json!({ "query": deck_query(&deck.path.name()) })))
			.await?;
		let notes = self.notes_info(ids).await?;
		Ok(notes
			.into_iter()
			.map(|note| {
				let mut fields: Vec<(String, Field)> = note.fields.into_iter().collect();
				fields.sort_by_key(|(_, f)| f.order);
				RemoteRecord {
					id: note.note_id,
					note_type: note.model_name,
					fields: fields.into_iter().map(|(n, f)| (n, f.value)).collect(),
					deck: deck.path.clone(),
				}
			})
			.collect())
	}

	async fn create_record(&self, record: NewRemoteRecord) -> Result<i64, RemoteError> {
		let params = json!({
			"note": {
				"deckName": record.deck.path.name(),
				"modelName": record.note_type,
				"fields": fields_object(&record.fields),
				"options": { "allowDuplicate": true },
			}
		});
		self.request("addNote", Some(params)).await
	}

	async fn update_record_fields(&self, id: i64, fields: Vec<(String, String)>) -> Result<(), RemoteError> {
		let params = json!({ "note": { "id": id, "fields": fields_object(&fields) } });
		self.make_request("updateNoteFields", Some(params)).await.map(|_| ())
	}

	async fn move_record(&self, id: i64, deck: &RemoteDeck) -> Result<(), RemoteError> {
		let note = self
			.notes_info(vec![id])
			.await?
			.into_iter()
			.next()
			.ok_or_else(|| RemoteError::NotFound(format!("note {id}")))?;
		self.change_deck(note.cards, &deck.path.name()).await
	}

	async fn delete_record(&self, id: i64) -> Result<(), RemoteError> {
		self.make_request("deleteNotes", Some(json!({ "notes": [id] })))
			.await
			.map(|_| ())
	}

	async fn create_deck(&self, path: &DeckPath) -> Result<i64, RemoteError> {
		self.request("createDeck", Some(json!({ "deck": path.name() }))).await
	}

	/// There is no rename action: build the new tree, move the cards over,
	/// then drop the emptied old decks.
	async fn rename_deck(&self, id: i64, to: &DeckPath) -> Result<i64, RemoteError> {
		let from = DeckPath::parse(&self.deck_name(id).await?).map_err(|e| RemoteError::Decode {
			action: "deckNamesAndIds".into(),
			reason: e.to_string(),
		})?;
		let mut subtree: Vec<DeckPath> = self
			.list_decks()
			.await?
			.into_iter()
			.map(|d| d.path)
			.filter(|p| p.starts_with(&from))
			.collect();
		subtree.sort_by_key(|p| p.depth());

		let mut new_top = None;
		for old in &subtree {
			let Some(new) = old.rebase(&from, to) else {
				continue;
			};
			let new_id = self.create_deck(&new).await?;
			if *old == from {
				new_top = Some(new_id);
			}
			let cards = self.cards_directly_in(&old.name()).await?;
			self.change_deck(cards, &new.name()).await?;
		}

		// Children go with the parent when `from` is deleted.
		if !to.starts_with(&from) {
			self.make_request("deleteDecks", Some(json!({ "decks": [from.name()], "cardsToo": true })))
				.await?;
		} else {
			for old in emptied_subdecks(&subtree, &from, to) {
				self.make_request("deleteDecks", Some(json!({ "decks": [old.name()], "cardsToo": true })))
					.await?;
			}
		}
		new_top.ok_or_else(|| RemoteError::NotFound(format!("deck '{from}'")))
	}

	async fn delete_deck(&self, deck: &RemoteDeck) -> Result<(), RemoteError> {
		self.make_request("deleteDecks", Some(json!({ "decks": [deck.path.name()], "cardsToo": true })))
			.await
			.map(|_| ())
	}

	async fn ensure_note_type(&self, note_type: &NoteType) -> Result<NoteTypeChange, RemoteError> {
		let models: HashMap<String, i64> = self.request("modelNamesAndIds", None).await?;
		let wanted = note_type.collection_fields();
		if !models.contains_key(&note_type.name) {
			let params = json!({
				"modelName": note_type.name,
				"inOrderFields": wanted,
				"css": CARD_CSS,
				"isCloze": note_type.kind == NoteKind::Cloze,
				"cardTemplates": card_templates(note_type),
			});
			self.make_request("createModel", Some(params)).await?;
			return Ok(NoteTypeChange::Created);
		}

		let present: Vec<String> = self
			.request("modelFieldNames", Some(json!({ "modelName": note_type.name })))
			.await?;
		let missing: Vec<String> = wanted
			.into_iter()
			.filter(|name| !present.iter().any(|p| p == name))
			.map(str::to_string)
			.collect();
		for field in &missing {
			self.make_request("modelFieldAdd", Some(json!({ "modelName": note_type.name, "fieldName": field })))
				.await?;
		}
		if missing.is_empty() {
			Ok(NoteTypeChange::Unchanged)
		} else {
			Ok(NoteTypeChange::FieldsAdded(missing))
		}
	}

	async fn media_dir(&self) -> Result<Option<PathBuf>, RemoteError> {
		let dir: String = self.request("getMediaDirPath", None).await?;
		Ok(Some(PathBuf::from(dir)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::models::note_type::NoteTypeRegistry;

	#[test]
	fn deck_query_excludes_subdecks() {
		assert_eq!(deck_query("Biology::Cells"), r#"deck:"Biology::Cells" -deck:"Biology::Cells::*""#);
	}

	#[test]
	fn search_wildcards_are_escaped() {
		assert_eq!(escape_search(r#"my_deck*"x""#), r#"my\_deck\*\"x\""#);
	}

	#[test]
	fn renaming_into_a_child_drops_the_old_subdecks() {
		let path = |name: &str| DeckPath::parse(name).unwrap();
		let subtree = vec![
			path("Biology"),
			path("Biology::Cells"),
			path("Biology::Cells::Organelles"),
			path("Biology::Genetics"),
		];
		let doomed = emptied_subdecks(&subtree, &path("Biology"), &path("Biology::Advanced"));
		assert_eq!(
			doomed,
			vec![path("Biology::Cells::Organelles"), path("Biology::Cells"), path("Biology::Genetics")]
		);

		let deep = emptied_subdecks(&subtree, &path("Biology"), &path("Biology::Cells::New"));
		assert_eq!(deep, vec![path("Biology::Cells::Organelles"), path("Biology::Genetics")]);
	}

	#[test]
	fn card_templates_follow_the_note_kind() {
		let registry = NoteTypeRegistry::default();
		let qa = card_templates(registry.get("CardSyncQA").unwrap());
		assert_eq!(qa[0]["Front"], "{{Question}}");
		let back = qa[0]["Back"].as_str().unwrap();
		assert!(back.contains("<div>{{Answer}}</div>"), "{back}");
		assert!(back.contains("{{#Extra}}"), "{back}");

		let cloze = card_templates(registry.get("CardSyncCloze").unwrap());
		assert_eq!(cloze.as_array().unwrap().len(), 1);
		assert!(cloze[0]["Front"].as_str().unwrap().starts_with("{{cloze:"));

		let reversed = card_templates(registry.get(REVERSED_TYPE).unwrap());
		assert_eq!(reversed.as_array().unwrap().len(), 2);

		let input = card_templates(registry.get("CardSyncInput").unwrap());
		assert!(input[0]["Back"].as_str().unwrap().contains("{{type:Input}}"));

		let choice = card_templates(registry.get("CardSyncChoice").unwrap());
		let front = choice[0]["Front"].as_str().unwrap();
		assert!(front.starts_with("{{Question}}"), "{front}");
		assert!(front.contains("{{Choice 8}}"), "{front}");
		assert!(!front.contains("{{Answer}}"), "{front}");
	}

	#[test]
	fn notes_info_decodes() {
		let raw = json!([{
			"noteId": 1502298033753i64,
			"modelName": "CardSyncQA",
			"tags": [],
			"fields": {
				"Answer": { "value": "a", "order": 1 },
				"Question": { "value": "q", "order": 0 }
			},
			"cards": [1498938915662i64]
		}]);
		let notes: Vec<NoteInfo> = serde_json::from_value(raw).unwrap();
		assert_eq!(notes[0].note_id, 1502298033753);
		assert_eq!(notes[0].fields["Question"].value, "q");
		assert_eq!(notes[0].cards.len(), 1);
	}

	#[tokio::test]
	async fn unreachable_server_is_retryable() {
		let client = AnkiConnect::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
		let err = client.list_decks().await.unwrap_err();
		assert!(err.is_retryable(), "{err:?}");
	}
}
