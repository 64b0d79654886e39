use std::collections::TryReserveError;
use std::fmt;
pub use Error::*;

/// Everything that can go wrong in the library
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Error {
    /// [`set_quality()`][crate::Attributes::set_quality] was used with a minimum quality, and the palette could not reach it.
    ///
    /// Lower the minimum or allow more colors and try again.
    QualityTooLow = 99,
    /// A setting or argument is outside of its documented range
    ValueOutOfRange = 100,
    /// An allocation failed. Either the process hit a limit, or image dimensions are absurd
    OutOfMemory,
    /// The progress callback asked to stop
    Aborted,
    /// A buffer is smaller than the image dimensions require, or too many fixed colors were added
    BufferTooSmall,
    /// A required input was empty
    InvalidPointer,
    /// This combination of options isn't implemented
    Unsupported,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    #[cold]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::QualityTooLow => "quality too low",
            Self::ValueOutOfRange => "value out of range",
            Self::OutOfMemory => "out of memory",
            Self::Aborted => "aborted",
            Self::BufferTooSmall => "buffer too small",
            Self::InvalidPointer => "invalid pointer",
            Self::Unsupported => "unsupported",
        })
    }
}

impl From<TryReserveError> for Error {
    #[cold]
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

#[test]
fn error_messages() {
    assert_eq!("quality too low", QualityTooLow.to_string());
    assert_eq!("buffer too small", BufferTooSmall.to_string());

    let mut v: Vec<u8> = Vec::new();
    let err: Error = v.try_reserve_exact(usize::MAX).unwrap_err().into();
    assert_eq!(OutOfMemory, err);
}
