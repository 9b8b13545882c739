pub mod guards;
pub mod local_api;
