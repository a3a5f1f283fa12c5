//! Storage layer: the ordered key-value store

pub mod btree;

pub use btree::{TokenTree, TreeCursor, OPAQUE_SIZE, PAGE_SIZE};
