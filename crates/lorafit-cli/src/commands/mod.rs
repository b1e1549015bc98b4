pub mod merge;
pub mod train;
