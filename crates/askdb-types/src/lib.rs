pub mod provider;
pub mod tool;
pub mod turn;

pub use provider::*;
pub use tool::*;
pub use turn::*;
