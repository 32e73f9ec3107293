pub mod response;
pub mod slug;
pub mod upload;
