use core::convert::Infallible;

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("{what} buffer is {actual} bytes, expected {expected}")]
    BufferSize {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("engine is not clocked")]
    ClockOff,
}

impl From<Infallible> for Error {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}

/// Returns an error unless `actual` is `expected`.
pub fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), Error> {
    if expected != actual {
        return Err(Error::BufferSize {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
