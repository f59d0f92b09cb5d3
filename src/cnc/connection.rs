use std::{io, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{split, AsyncRead, AsyncWrite},
    time::sleep,
};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, StopBits};
use tracing::info;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/*
    Where the bytes go. Opening yields the two halves of the link; closing is dropping
the writer and stopping whoever reads.
*/
#[async_trait]
pub trait Transport: Send {
    async fn open(&mut self) -> io::Result<(BoxedReader, BoxedWriter)>;
    fn describe(&self) -> String;
}

pub const DEFAULT_BAUD_RATE: u32 = 115200;

pub struct SerialTransport {
    path: String,
    baud_rate: u32,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        SerialTransport {
            path: path.into(),
            baud_rate,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    // Toggling DTR resets Arduino-like boards, so every open starts with a banner.
    async fn open(&mut self) -> io::Result<(BoxedReader, BoxedWriter)> {
        let mut port = tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(30))
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()?;
        port.write_data_terminal_ready(false)?;
        sleep(Duration::from_millis(2)).await;
        port.write_data_terminal_ready(true)?;
        info!("opened {}", self.describe());
        let (reader, writer) = split(port);
        Ok((Box::new(reader), Box::new(writer)))
    }
    fn describe(&self) -> String {
        format!("serial port {} @ {}", self.path, self.baud_rate)
    }
}
