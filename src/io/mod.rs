//! Source access: opening local files and undoing their compression

pub mod source;

pub use source::{Compression, open_source};
