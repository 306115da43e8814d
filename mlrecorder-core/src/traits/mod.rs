pub mod capture_backend;
pub mod session_observer;
