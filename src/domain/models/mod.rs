pub mod close;
pub mod envelope;
