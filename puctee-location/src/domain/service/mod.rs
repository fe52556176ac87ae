pub mod coordinate_source;
pub mod share_session;
