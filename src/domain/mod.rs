pub mod capacity;
pub mod device;
pub mod tariff;

pub use capacity::*;
pub use device::*;
pub use tariff::*;
