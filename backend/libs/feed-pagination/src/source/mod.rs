//! `PageSource` implementations

pub mod http;
pub mod memory;

pub use http::HttpPageSource;
pub use memory::InMemoryFeedSource;
