pub mod config;
pub mod init;
pub mod modes;
pub mod report;
pub mod run;
pub mod state;
