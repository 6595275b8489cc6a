pub mod annotations;
pub mod bbox;
pub mod dataset;
pub mod download;
pub mod error;
pub mod evaluate;
pub mod predict;
pub mod preprocess;

pub use error::Result;
