pub mod mixed;
pub mod synthetic;
pub mod threaded;
