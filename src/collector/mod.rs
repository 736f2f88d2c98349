//! On-demand collection from terminals that hold one session at a time

mod sequential;

pub use sequential::SequentialCollector;
