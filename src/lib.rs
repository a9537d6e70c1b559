pub mod annotation;
pub mod config;
pub mod error;
mod http;
pub mod records;
pub mod resolve;
pub mod search;
pub mod trainer;

pub use annotation::AnnotationClient;
pub use error::{Error, Result};
pub use search::SearchClient;
pub use trainer::TrainerClient;
