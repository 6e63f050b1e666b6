//! Outbound link to the microcontroller.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("transport already finished")]
    Finished,
}

/// Point-to-point sender of formatted scalar values.
pub trait Transport {
    fn send(&mut self, value: &str) -> Result<(), TransportError>;

    /// Flush and release the link. Later sends fail.
    fn finish(&mut self) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, value: &str) -> Result<(), TransportError> {
        (**self).send(value)
    }

    fn finish(&mut self) -> Result<(), TransportError> {
        (**self).finish()
    }
}

/// Newline-terminated ASCII over any writer: a serial device node, a pipe,
/// a file or stdout.
pub struct LineTransport<W: Write> {
    writer: Option<W>,
}

impl<W: Write> LineTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    /// Give back the writer, if the transport has not been finished.
    pub fn into_inner(self) -> Option<W> {
        self.writer
    }
}

impl LineTransport<BufWriter<std::fs::File>> {
    /// Open a device node (e.g. `/dev/ttyUSB0`, configured beforehand) or a
    /// regular file for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        log::info!("transport opened at {}", path.as_ref().display());
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> Transport for LineTransport<W> {
    fn send(&mut self, value: &str) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::Finished)?;
        writer.write_all(value.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TransportError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}
