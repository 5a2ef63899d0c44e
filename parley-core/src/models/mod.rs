pub mod message;
pub mod session;

pub use message::{Message, MessageRole};
pub use session::{SamplingDefaults, Session};
