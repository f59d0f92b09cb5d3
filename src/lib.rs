pub mod cnc;
pub mod error;
pub mod settings;
pub mod util;

pub use cnc::{
    connection::{SerialTransport, Transport},
    machine::{DiagnosticSession, MachineHandle},
    streamer::{MachineSnapshot, Streamer},
};
pub use error::{StreamerError, StreamerResult};
pub use settings::Settings;
