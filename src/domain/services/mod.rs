pub mod conflict_resolver;
pub mod event_filter;

pub use conflict_resolver::{resolve, resolve_against, Resolution};
pub use event_filter::{EventFilter, FilterVerdict, SeenTokens};
