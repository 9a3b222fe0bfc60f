pub mod nozzle;
pub mod router;
pub mod source;
