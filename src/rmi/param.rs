//! Direction-tagged call parameters.
//!
//! Every argument of a remote method is tagged:
//! - [`In`] - serialized into the call frame, never written back
//! - [`Out`] - not sent, filled from the result frame
//! - [`InOut`] - sent, then overwritten from the result frame
//!
//! Outputs are decoded into staging first and only committed to the caller's
//! storage once every output decoded, so a failed call leaves them untouched.
//!
//! # Example
//!
//! ```ignore
//! let mut sum = 0u32;
//! let status = proxy
//!     .call("add", &mut [&mut In(&2u32), &mut In(&3u32), &mut Out::new(&mut sum)])
//!     .await;
//! ```

use crate::buffer::{Buffer, Decode, Encode};
use crate::error::Result;

/// Which way an argument travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    #[inline]
    pub fn is_input(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    #[inline]
    pub fn is_output(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

/// One argument of a remote call.
pub trait Param: Send {
    fn direction(&self) -> Direction;

    /// Append the input value, if this is an input.
    fn encode_input(&self, buf: &mut Buffer) -> Result<()>;

    /// Decode the output value into staging, if this is an output.
    fn decode_output(&mut self, buf: &mut Buffer) -> Result<()>;

    /// Move a staged output into the caller's storage.
    fn commit(&mut self);
}

/// Input-only argument.
pub struct In<'a, T: ?Sized>(pub &'a T);

impl<T: Encode + Sync + ?Sized> Param for In<'_, T> {
    fn direction(&self) -> Direction {
        Direction::In
    }

    fn encode_input(&self, buf: &mut Buffer) -> Result<()> {
        self.0.encode(buf)
    }

    fn decode_output(&mut self, _buf: &mut Buffer) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) {}
}

/// Output-only argument.
pub struct Out<'a, T> {
    target: &'a mut T,
    staged: Option<T>,
}

impl<'a, T> Out<'a, T> {
    pub fn new(target: &'a mut T) -> Self {
        Self {
            target,
            staged: None,
        }
    }
}

impl<T: Decode + Send> Param for Out<'_, T> {
    fn direction(&self) -> Direction {
        Direction::Out
    }

    fn encode_input(&self, _buf: &mut Buffer) -> Result<()> {
        Ok(())
    }

    fn decode_output(&mut self, buf: &mut Buffer) -> Result<()> {
        self.staged = Some(buf.read()?);
        Ok(())
    }

    fn commit(&mut self) {
        if let Some(value) = self.staged.take() {
            *self.target = value;
        }
    }
}

/// Input/output argument.
pub struct InOut<'a, T> {
    target: &'a mut T,
    staged: Option<T>,
}

impl<'a, T> InOut<'a, T> {
    pub fn new(target: &'a mut T) -> Self {
        Self {
            target,
            staged: None,
        }
    }
}

impl<T: Encode + Decode + Send> Param for InOut<'_, T> {
    fn direction(&self) -> Direction {
        Direction::InOut
    }

    fn encode_input(&self, buf: &mut Buffer) -> Result<()> {
        self.target.encode(buf)
    }

    fn decode_output(&mut self, buf: &mut Buffer) -> Result<()> {
        self.staged = Some(buf.read()?);
        Ok(())
    }

    fn commit(&mut self) {
        if let Some(value) = self.staged.take() {
            *self.target = value;
        }
    }
}

/// Serialize every input-tagged argument in declared order.
pub fn encode_inputs(buf: &mut Buffer, params: &[&mut dyn Param]) -> Result<()> {
    for param in params.iter().filter(|p| p.direction().is_input()) {
        param.encode_input(buf)?;
    }
    Ok(())
}

/// Decode every output-tagged argument in declared order, committing only
/// if all of them decoded.
pub fn decode_outputs(buf: &mut Buffer, params: &mut [&mut dyn Param]) -> Result<()> {
    for param in params.iter_mut().filter(|p| p.direction().is_output()) {
        param.decode_output(buf)?;
    }
    for param in params.iter_mut() {
        param.commit();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RmiError;

    #[test]
    fn test_only_inputs_are_encoded() {
        let name = "cloud".to_string();
        let mut count = 4u32;
        let mut out = 0u64;

        let mut buf = Buffer::new();
        encode_inputs(
            &mut buf,
            &[
                &mut In(&name),
                &mut Out::new(&mut out),
                &mut InOut::new(&mut count),
            ],
        )
        .unwrap();

        assert_eq!(buf.read::<String>().unwrap(), "cloud");
        assert_eq!(buf.read::<u32>().unwrap(), 4);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_outputs_committed_in_order() {
        let mut reply = Buffer::new();
        reply.write(&11u64).unwrap().write(&22u32).unwrap();

        let mut out = 0u64;
        let mut count = 4u32;
        decode_outputs(
            &mut reply,
            &mut [
                &mut In(&"ignored"),
                &mut Out::new(&mut out),
                &mut InOut::new(&mut count),
            ],
        )
        .unwrap();

        assert_eq!(out, 11);
        assert_eq!(count, 22);
    }

    #[test]
    fn test_failed_decode_leaves_outputs_untouched() {
        // Second output is missing.
        let mut reply = Buffer::new();
        reply.write(&11u64).unwrap();

        let mut first = 1u64;
        let mut second = 2u32;
        let err = decode_outputs(
            &mut reply,
            &mut [&mut Out::new(&mut first), &mut Out::new(&mut second)],
        )
        .unwrap_err();

        assert!(matches!(err, RmiError::BufferUnderflow { .. }));
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_direction_flags() {
        assert!(Direction::In.is_input() && !Direction::In.is_output());
        assert!(!Direction::Out.is_input() && Direction::Out.is_output());
        assert!(Direction::InOut.is_input() && Direction::InOut.is_output());
    }
}
