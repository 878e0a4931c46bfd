pub mod grid_mix;
pub mod load;
pub mod solar;

pub use grid_mix::*;
pub use load::*;
pub use solar::*;
