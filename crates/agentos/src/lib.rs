pub mod agent;
pub mod engines;
pub mod errors;
pub mod models;
pub mod prompt_template;
pub mod settings;
pub mod transport;
pub mod utils;
pub mod voting;
