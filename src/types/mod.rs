pub mod price;
pub mod forecast;

pub use price::*;
pub use forecast::*;
