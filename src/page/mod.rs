//! Memory-Mapped Pages
//!
//! Storage is a directory of fixed-size page files, each mapped into the
//! process on first access.
//!
//! ```text
//! <dir>/<name>/
//!   page-0.dat   ┐
//!   page-1.dat   │ page_size bytes each, mapped read-write
//!   page-2.dat   ┘
//! ```
//!
//! - [`MappedPage`]: one mapping with bounds-checked positional access and
//!   explicit release
//! - [`MappedPageFactory`]: the per-directory cache of mappings and the
//!   owner of file creation, enumeration and deletion

pub mod factory;
pub mod mapped_page;

pub use factory::{page_file_name, parse_page_file_name, MappedPageFactory};
pub use mapped_page::MappedPage;
