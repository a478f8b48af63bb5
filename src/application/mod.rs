pub mod bootstrap;
pub mod commands;
pub mod conflict;
pub mod session_controller;
