pub use self::parser::{Config, DatabaseConfig, LoggingConfig, ScanConfig, WebConfig};
pub use self::validator::ConfigError;

mod parser;
mod validator;
