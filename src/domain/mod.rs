pub mod account;
pub mod health;
pub mod report;

pub use account::*;
pub use health::*;
pub use report::*;
