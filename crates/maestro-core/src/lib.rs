pub mod config;
pub mod dispatcher;
pub mod document;
pub mod error;
pub mod executor;
pub mod io;
pub mod mode;
pub mod parser;
pub mod paths;
pub mod report;
pub mod router;
pub mod routing;
pub mod state;
pub mod task;
pub mod types;
pub mod validator;

pub use error::{MaestroError, Result};
