pub mod join;
pub mod keys;
pub mod serve;
