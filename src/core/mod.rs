pub mod chat_stream;
pub mod config;
pub mod credentials;
pub mod directive;
pub mod message;
pub mod oauth;
pub mod round;
pub mod segmenter;
pub mod store;
