//! Title data model
//!
//! Titles are the only record kind the cluster stores. A title's
//! `title_type` is its category: it selects the owning fragment and never
//! changes after insert.

mod query;
mod title;

pub use query::{sort_titles, Page, Pagination, SortKey, TitleFilter, TitleQuery, Window};
pub use title::{
    decode_genres, encode_genres, ModelError, NewTitle, Title, TitleChanges, TitleId, TitleType,
};
