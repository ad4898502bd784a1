pub mod settings;
pub mod secrets;

pub use settings::*;
pub use secrets::*;
