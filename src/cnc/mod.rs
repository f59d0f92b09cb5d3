pub mod command;
pub mod connection;
pub mod events;
pub mod gcode;
pub mod grbl;
pub mod machine;
pub mod overrides;
pub mod program;
pub mod scheduler;
pub mod state_builder;
pub mod streamer;
pub mod threading;
pub mod time_projection;
