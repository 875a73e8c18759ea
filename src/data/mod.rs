#![allow(dead_code)]

//! The data core: pages, files, the bounded cache, the namespace tree,
//! detached metadata, and the transfer buffer pool.

pub mod cache;
pub mod file;
pub mod lru;
pub mod meta;
pub mod page;
pub mod resource;
pub mod tree;
