pub mod cancel;
pub mod download;
pub mod status;
pub mod upload;
