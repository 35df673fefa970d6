//! pagebind - parallel OCR of scanned pages with ordered group assembly.
//!
//! Pages are taken in by upload order, OCR'd by a pool of workers in any
//! order, and put back together into groups delimited by bookmark pages.

pub mod cli;
pub mod config;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod repository;
pub mod schema;
pub mod storage;
