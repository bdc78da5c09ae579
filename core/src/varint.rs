//! LEB128 varint helpers over the buffers the frame codec works with.
//!
//! `leb128::read::unsigned` wants an `io::Read`; a `&mut &[u8]` advances
//! itself as bytes are consumed, which is exactly the "remaining input"
//! cursor the decoder needs without a separate position field.

use std::io;

/// Decode a LEB128 `u64` from the front of `input`, advancing it past the
/// bytes consumed. Returns `Ok(None)` if `input` doesn't yet contain a
/// complete varint (need-more-bytes, per the frame codec's contract).
pub fn decode(input: &mut &[u8]) -> io::Result<Option<u64>> {
    let mut cursor = *input;
    match leb128::read::unsigned(&mut cursor) {
        Ok(value) => {
            *input = cursor;
            Ok(Some(value))
        }
        Err(leb128::read::Error::IoError(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
            Ok(None)
        }
        Err(leb128::read::Error::IoError(err)) => Err(err),
        Err(leb128::read::Error::Overflow) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "leb128 varint overflowed u64",
        )),
    }
}

/// Append `value` to `out` as a LEB128 varint.
pub fn encode(value: u64, out: &mut Vec<u8>) {
    leb128::write::unsigned(out, value).expect("writing to a Vec<u8> cannot fail");
}
