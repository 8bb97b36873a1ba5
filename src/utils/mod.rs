pub mod auth;
pub mod logging;
pub mod text;
pub mod url;
