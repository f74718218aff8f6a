pub mod retry;
pub mod transcoder;
