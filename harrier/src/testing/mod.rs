mod adb;
pub use adb::*;

mod catalog;
pub use catalog::*;

mod context;
pub use context::*;

mod device;
pub use device::*;

mod temp;
pub use temp::*;

mod provision;
pub use provision::*;
