pub mod classifier;
pub mod clock;
pub mod models;
pub mod pose;
pub mod settings;
