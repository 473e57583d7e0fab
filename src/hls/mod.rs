//! M3U8 handling: URL resolution, proxy references and line rewriting.

pub mod reference;
pub mod resolver;
pub mod rewriter;

pub use reference::UriKind;
pub use resolver::UrlResolver;
pub use rewriter::{PlaylistKind, PlaylistLine, Rewritten};
