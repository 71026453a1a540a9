pub mod credential;
pub mod key;
pub mod maintenance;
pub mod token;
