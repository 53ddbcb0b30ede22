pub mod base;
pub mod bootstrap;
pub mod completion;
pub mod direct;
pub mod embeddings;
pub mod model_name;
pub mod registry;
