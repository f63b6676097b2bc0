//! This is a helper module that gives the rest of the crate a single
//! import point for the async sync primitives in use.

pub use tokio::sync::{Mutex, Notify, OnceCell, RwLock};
