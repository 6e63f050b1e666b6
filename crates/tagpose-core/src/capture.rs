use crate::ColorFrame;

/// Errors reported by a frame source.
#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("capture device returned no frame")]
    NoFrame,
    #[error("capture device exhausted")]
    Exhausted,
    #[error("capture backend `{0}` is not available in this build")]
    Unavailable(String),
    #[error("failed to decode frame {path}: {message}")]
    Decode { path: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A capture device producing color frames at a fixed resolution.
///
/// Opened once and read repeatedly; the pipeline owns it exclusively.
pub trait FrameSource {
    /// Pull the next frame.
    fn read(&mut self) -> Result<ColorFrame, CaptureError>;

    /// Resolution `(width, height)` the device was configured with.
    fn resolution(&self) -> (usize, usize);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read(&mut self) -> Result<ColorFrame, CaptureError> {
        (**self).read()
    }

    fn resolution(&self) -> (usize, usize) {
        (**self).resolution()
    }
}
