pub mod conflict;
pub mod recording_session;
pub mod registry;
