//! Call and result frame marshalling.
//!
//! ```text
//! Call:   [object: Guid][method: u32 len + UTF-8][inputs in declared order]
//! Result: [status: u8][outputs in declared order]
//! ```
//!
//! Outputs are only present when the status is `Success`.

use std::time::Duration;

use bytes::Bytes;

use super::param::{decode_outputs, encode_inputs, Param};
use crate::buffer::Buffer;
use crate::error::{RmiError, Result};
use crate::guid::Guid;
use crate::protocol::Status;
use crate::transport::Pipe;

/// A decoded call frame, as seen by the serving side.
#[derive(Debug)]
pub struct CallRequest {
    pub object: Guid,
    pub method: String,
    /// Serialized inputs, positioned at the first one.
    pub inputs: Buffer,
}

/// Build a call payload from the input-tagged parameters.
pub fn encode_call(object: Guid, method: &str, params: &[&mut dyn Param]) -> Result<Bytes> {
    let mut buf = Buffer::new();
    buf.write(&object)?.write(method)?;
    encode_inputs(&mut buf, params)?;
    Ok(buf.freeze())
}

pub fn decode_call(payload: &[u8]) -> Result<CallRequest> {
    let mut buf = Buffer::from_bytes(payload);
    let object = buf.read::<Guid>()?;
    let method = buf.read::<String>()?;
    let inputs = Buffer::from_bytes(buf.read_remaining());
    Ok(CallRequest {
        object,
        method,
        inputs,
    })
}

/// Build a result payload. Outputs are dropped for a non-success status.
pub fn encode_result(status: Status, outputs: Option<&Buffer>) -> Bytes {
    let extra = outputs.map_or(0, Buffer::len);
    let mut buf = Buffer::with_capacity(1 + extra);
    buf.write_raw(&[status as u8]);
    if let (Status::Success, Some(outputs)) = (status, outputs) {
        buf.write_raw(outputs.as_slice());
    }
    buf.freeze()
}

/// Result payload for a finished server-side call.
pub fn result_from(outcome: Result<Buffer>) -> Bytes {
    match outcome {
        Ok(outputs) => encode_result(Status::Success, Some(&outputs)),
        Err(e) => encode_result(e.status(), None),
    }
}

/// Decode a result payload into the output-tagged parameters.
///
/// A non-success status is returned as [`RmiError::Remote`] and leaves every
/// output untouched.
pub fn decode_result(payload: &[u8], params: &mut [&mut dyn Param]) -> Result<()> {
    let mut buf = Buffer::from_bytes(payload);
    let status = buf.read::<Status>()?;
    if !status.is_success() {
        return Err(RmiError::Remote(status));
    }
    decode_outputs(&mut buf, params)
}

/// Invoke `method` on `object` over `pipe` and wait at most `timeout`.
pub async fn invoke(
    pipe: &Pipe,
    object: Guid,
    method: &str,
    params: &mut [&mut dyn Param],
    timeout: Duration,
) -> Result<()> {
    let payload = encode_call(object, method, params)?;
    let frame = pipe.call_with_timeout(payload, timeout).await?;
    decode_result(frame.payload(), params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rmi::param::{In, InOut, Out};

    #[test]
    fn test_call_frame_layout() {
        let object = Guid::from_parts(1, 2);
        let payload = encode_call(object, "read", &[&mut In(&64u64), &mut In(&"tile")]).unwrap();

        let mut request = decode_call(&payload).unwrap();
        assert_eq!(request.object, object);
        assert_eq!(request.method, "read");
        assert_eq!(request.inputs.read::<u64>().unwrap(), 64);
        assert_eq!(request.inputs.read::<String>().unwrap(), "tile");
        assert_eq!(request.inputs.remaining(), 0);
    }

    #[test]
    fn test_truncated_call_frame() {
        let err = decode_call(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, RmiError::BufferUnderflow { .. }));
    }

    #[test]
    fn test_success_result_fills_outputs() {
        let mut outputs = Buffer::new();
        outputs.write(&9u32).unwrap().write(&true).unwrap();
        let payload = result_from(Ok(outputs));

        let mut count = 0u32;
        let mut flag = false;
        decode_result(
            &payload,
            &mut [&mut Out::new(&mut count), &mut InOut::new(&mut flag)],
        )
        .unwrap();
        assert_eq!(count, 9);
        assert!(flag);
    }

    #[test]
    fn test_failure_status_leaves_outputs() {
        let payload = result_from(Err(RmiError::Remote(Status::UnknownMethod)));
        assert_eq!(&payload[..], &[Status::UnknownMethod as u8]);

        let mut count = 5u32;
        let err = decode_result(&payload, &mut [&mut Out::new(&mut count)]).unwrap_err();
        assert!(matches!(err, RmiError::Remote(Status::UnknownMethod)));
        assert_eq!(count, 5);
    }

    #[test]
    fn test_non_success_drops_outputs() {
        let mut outputs = Buffer::new();
        outputs.write(&1u8).unwrap();
        let payload = encode_result(Status::Failed, Some(&outputs));
        assert_eq!(payload.len(), 1);
    }
}
