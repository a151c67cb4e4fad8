pub mod context;
pub mod error;

pub use context::{Context, ContextBuilder};
pub use error::{QueryError, Result};
