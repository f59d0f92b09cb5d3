pub mod config;
pub mod machine;
pub mod messages;
pub mod parser;
pub mod realtime;
pub mod version;
