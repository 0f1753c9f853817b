#![forbid(unsafe_code)]

pub mod client;
pub mod parse;

pub use client::{StripchatClient, StripchatConfig};

pub const DEFAULT_BASE_URL: &str = "https://stripchat.com";
pub const DEFAULT_THUMBNAIL_BASE: &str = "https://img.strpst.com/thumbs";
pub const DEFAULT_USER_AGENT: &str =
	"Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
