pub mod generator;
pub mod random;
