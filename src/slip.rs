//! SLIP framing over a [`Transport`].
//!
//! Frames are sent as a delimiter, the escaped body (possibly written in
//! several parts) and a closing delimiter. Received frames have a fixed
//! decoded length known to the caller.

use crate::transport::Transport;
use crate::Error;

/// Frame delimiter
pub const END: u8 = 0xC0;

/// Escape byte
pub const ESC: u8 = 0xDB;

/// Escaped form of [`END`] (follows [`ESC`])
pub const ESC_END: u8 = 0xDC;

/// Escaped form of [`ESC`] (follows [`ESC`])
pub const ESC_ESC: u8 = 0xDD;

const END_REPLACEMENT: [u8; 2] = [ESC, ESC_END];
const ESC_REPLACEMENT: [u8; 2] = [ESC, ESC_ESC];

/// Write a frame delimiter
pub fn send_delimiter<T: Transport>(port: &mut T) -> Result<(), Error<T::Error>> {
    let timeout = port.remaining_time();
    port.write(&[END], timeout)
}

/// Write an escaped frame body part.
///
/// Runs of plain bytes are written in a single call.
pub fn send<T: Transport>(port: &mut T, data: &[u8]) -> Result<(), Error<T::Error>> {
    let mut start = 0;

    for (i, b) in data.iter().enumerate() {
        let replacement = match *b {
            END => &END_REPLACEMENT,
            ESC => &ESC_REPLACEMENT,
            _ => continue,
        };

        if i > start {
            let timeout = port.remaining_time();
            port.write(&data[start..i], timeout)?;
        }

        let timeout = port.remaining_time();
        port.write(replacement, timeout)?;

        start = i + 1;
    }

    if start < data.len() {
        let timeout = port.remaining_time();
        port.write(&data[start..], timeout)?;
    }

    Ok(())
}

/// Write a complete frame made up of the provided parts
pub fn send_frame<T: Transport>(port: &mut T, parts: &[&[u8]]) -> Result<(), Error<T::Error>> {
    send_delimiter(port)?;
    for p in parts {
        send(port, p)?;
    }
    send_delimiter(port)
}

fn read_byte<T: Transport>(port: &mut T) -> Result<u8, Error<T::Error>> {
    let mut b = [0u8; 1];
    let timeout = port.remaining_time();
    port.read(&mut b, timeout)?;
    Ok(b[0])
}

/// Receive a frame, filling exactly `buff.len()` decoded bytes.
///
/// Bytes preceding the opening delimiter are discarded.
pub fn receive<T: Transport>(port: &mut T, buff: &mut [u8]) -> Result<(), Error<T::Error>> {
    while read_byte(port)? != END {}

    for b in buff.iter_mut() {
        *b = match read_byte(port)? {
            ESC => match read_byte(port)? {
                ESC_END => END,
                ESC_ESC => ESC,
                v => {
                    debug!("Invalid SLIP escape sequence: 0x{:02x} 0x{:02x}", ESC, v);
                    return Err(Error::InvalidResponse)
                }
            },
            v => v,
        };
    }

    match read_byte(port)? {
        END => Ok(()),
        v => {
            debug!("Expected SLIP delimiter, received 0x{:02x}", v);
            Err(Error::InvalidResponse)
        }
    }
}
