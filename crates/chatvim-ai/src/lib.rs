//! chatvim-ai: streaming chat completion providers
//!
//! Each provider turns a list of chat messages into a [`FragmentStream`]: the
//! incremental pieces of assistant text, in order, with provider-specific
//! response shapes normalized away.

pub mod error;
pub mod models;
pub mod providers;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use stream::{Decoded, FragmentExtractor, FragmentStream};
pub use types::*;
