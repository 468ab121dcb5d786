pub mod deck;
pub mod mapping;
pub mod note_type;
pub mod operation;
pub mod record;

pub use deck::{DeckNameError, DeckPath};
pub use mapping::{DeckRow, MappingDelta, MappingState, NoteRow};
pub use note_type::{Detection, NoteType, NoteTypeError, NoteTypeRegistry, KEY_FIELD};
pub use operation::{DeckOp, Direction, Locator, OpKind, Operation, PlanSummary, RecordOp, Side};
pub use record::{ContentHash, Fields, Origin, Record};
