pub mod conversation;
pub mod message;
pub mod outgoing_status;
pub mod row;

pub use conversation::Conversation;
pub use message::{Direction, Message};
pub use outgoing_status::{OutgoingStatus, Stage, UnknownStage};
pub use row::{ChangeKind, PushEvent, Row, Table};
