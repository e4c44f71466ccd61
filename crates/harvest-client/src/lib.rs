pub mod catalogue;
pub mod document;
pub mod fetcher;

pub use catalogue::{Book, BookPage, Catalogue, ListPage};
pub use document::{Document, Node, Selection};
pub use fetcher::{FetcherConfig, ReqwestFetcher};
