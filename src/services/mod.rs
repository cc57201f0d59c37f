pub mod classifier;
pub mod cleanup;
pub mod download;
pub mod extractor;
pub mod pipeline;
pub mod retention;
pub mod spreadsheet;
pub mod stager;
