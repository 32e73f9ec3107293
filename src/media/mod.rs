pub mod publisher;
pub mod rendition;
pub mod transcoder;

#[cfg(all(test, unix))]
pub mod testing;
