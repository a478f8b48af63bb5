pub mod config;
pub mod error;
pub mod http_session_store;
pub mod logging;
pub mod session_store;
pub mod sqlite_session_store;
pub mod storage;
