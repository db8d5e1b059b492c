pub mod app_state;
pub mod cli;
pub mod logging;
