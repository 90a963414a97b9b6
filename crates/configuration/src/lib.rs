pub mod error;
pub mod grid;
pub mod settings;

pub use error::ConfigError;
pub use grid::GridParameters;
pub use settings::Settings;
