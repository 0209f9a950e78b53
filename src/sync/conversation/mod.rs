//! Conversation store and the message stream of the active conversation.

mod state;
pub mod store;
pub mod stream;

pub use store::ConversationStore;
pub use stream::{LoadOutcome, MessageStream, SendReceipt};
