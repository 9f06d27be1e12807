use crate::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Opens one side of the bridge.
///
/// Each call yields a fresh channel; dropping the stream releases it.
pub trait Opener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn open(&self) -> Result<Self::Stream>;

    /// Human readable name used in logs.
    fn describe(&self) -> String;
}

/// Writes a complete frame and flushes it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    sink: &mut W,
    frame: &[u8],
    role: &'static str,
) -> Result<()> {
    sink.write_all(frame)
        .await
        .map_err(|err| Error::Write(role, err))?;
    sink.flush().await.map_err(|err| Error::Write(role, err))?;
    log::debug!(
        "Message sent to {role} link: {} (length: {})",
        frame.escape_ascii(),
        frame.len()
    );
    Ok(())
}

#[cfg(feature = "tokio-serial-async")]
pub use serial::SerialLink;

#[cfg(feature = "tokio-serial-async")]
mod serial {
    use super::Opener;
    use crate::config::LinkConfig;
    use crate::error::{Error, Result};
    use tokio_serial::{SerialPort, SerialPortBuilderExt};

    /// A serial port opened with 8N1 and no flow control.
    #[derive(Debug, Clone)]
    pub struct SerialLink {
        role: &'static str,
        config: LinkConfig,
    }

    impl SerialLink {
        pub fn master(config: LinkConfig) -> Self {
            Self {
                role: "master",
                config,
            }
        }

        pub fn slave(config: LinkConfig) -> Self {
            Self {
                role: "slave",
                config,
            }
        }
    }

    impl Opener for SerialLink {
        type Stream = tokio_serial::SerialStream;

        fn open(&self) -> Result<Self::Stream> {
            let open_error = |err: tokio_serial::Error| Error::ChannelOpen {
                role: self.role,
                device: self.config.device.clone(),
                reason: err.to_string(),
            };
            let stream = tokio_serial::new(&self.config.device, self.config.baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(open_error)?;
            // stale bytes would be taken for the start of a frame
            stream
                .clear(tokio_serial::ClearBuffer::Input)
                .map_err(open_error)?;
            Ok(stream)
        }

        fn describe(&self) -> String {
            format!(
                "{} {} @ {}",
                self.role, self.config.device, self.config.baud_rate
            )
        }
    }
}
