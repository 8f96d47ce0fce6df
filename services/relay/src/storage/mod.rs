pub mod queue;

pub use queue::{MessageStore, StoreError};
