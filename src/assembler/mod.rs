//! Assembly of streamed replies into conversations.
//!
//! [`StreamingReplyAssembler`] owns the lifecycle of a send:
//! - the user message and an empty assistant placeholder are appended to the target conversation
//! - every cumulative chunk replaces the placeholder content
//! - the terminal chunk attributes newly generated images and persists the reply
//! - transport failures swap in a fixed fallback message
//!
//! Sessions are bound to the conversation they were opened for and never
//! follow the active selection.

pub mod events;
pub mod images;
pub mod reply;
pub mod session;

pub use events::AssemblerEvent;
pub use images::diff_images;
pub use reply::StreamingReplyAssembler;
pub use session::{SessionHandle, SessionOutcome, SessionPhase, SessionRegistry, StreamSession};
