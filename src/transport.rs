//! Byte transport used by the programmer, and an adaptor over
//! embedded-hal serial ports.

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::Error;

/// Serial port with the control lines used to reset into the bootloader
pub trait SerialPort<E>: Write<u8, Error=E> + Read<u8, Error=E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

/// Blocking byte transport with per-call timeouts.
///
/// `start_timer` sets the time budget for the operation in progress and
/// `remaining_time` reports what is left of it, both in milliseconds.
pub trait Transport {
    type Error: core::fmt::Debug;

    /// Read exactly `buff.len()` bytes
    fn read(&mut self, buff: &mut [u8], timeout_ms: u32) -> Result<(), Error<Self::Error>>;

    /// Write all of `buff`
    fn write(&mut self, buff: &[u8], timeout_ms: u32) -> Result<(), Error<Self::Error>>;

    fn start_timer(&mut self, timeout_ms: u32);

    fn remaining_time(&self) -> u32;

    /// Reset the target into its serial bootloader, where supported
    fn enter_bootloader(&mut self, _init_delay_ms: u32) -> Result<(), Error<Self::Error>> {
        Ok(())
    }
}

/// [`Transport`] over a polled embedded-hal serial port
pub struct HalTransport<P, D, E> {
    port: P,
    delay: D,
    poll_delay_ms: u32,
    remaining_ms: u32,
    _err: PhantomData<E>,
}

impl <P, D, E> HalTransport<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(port: P, delay: D, poll_delay_ms: u32) -> Self {
        Self{ port, delay, poll_delay_ms: poll_delay_ms.max(1), remaining_ms: 0, _err: PhantomData }
    }

    /// Release the underlying port and delay
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }

    fn wait(&mut self) {
        self.delay.delay_ms(self.poll_delay_ms);
        self.remaining_ms = self.remaining_ms.saturating_sub(self.poll_delay_ms);
    }

    /// Poll a non-blocking port operation, `t` accumulates time spent across calls
    fn poll<R, F>(&mut self, t: &mut u32, timeout_ms: u32, mut f: F) -> Result<R, Error<E>>
    where
        F: FnMut(&mut P) -> nb::Result<R, E>,
    {
        loop {
            match f(&mut self.port) {
                Ok(v) => return Ok(v),
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }

            if *t >= timeout_ms {
                debug!("Serial timeout ({} ms)", timeout_ms);
                return Err(Error::ResponseTimeout)
            }

            self.wait();
            *t += self.poll_delay_ms;
        }
    }
}

impl <P, D, E> Transport for HalTransport<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    type Error = E;

    fn read(&mut self, buff: &mut [u8], timeout_ms: u32) -> Result<(), Error<E>> {
        let mut t = 0;

        for b in buff.iter_mut() {
            *b = self.poll(&mut t, timeout_ms, |p| p.read())?;
        }

        Ok(())
    }

    fn write(&mut self, buff: &[u8], timeout_ms: u32) -> Result<(), Error<E>> {
        let mut t = 0;

        for b in buff {
            self.poll(&mut t, timeout_ms, |p| p.write(*b))?;
        }
        self.poll(&mut t, timeout_ms, |p| p.flush())
    }

    fn start_timer(&mut self, timeout_ms: u32) {
        self.remaining_ms = timeout_ms;
    }

    fn remaining_time(&self) -> u32 {
        self.remaining_ms
    }

    fn enter_bootloader(&mut self, init_delay_ms: u32) -> Result<(), Error<E>> {
        debug!("Resetting device into bootloader");

        // DTR drives the boot strap, RTS drives chip enable (both inverted)
        self.port.set_dtr(false)?;
        self.port.set_rts(true)?;

        self.delay.delay_ms(100u32);

        self.port.set_dtr(true)?;
        self.port.set_rts(false)?;

        self.delay.delay_ms(init_delay_ms);

        self.port.set_dtr(false)?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;

    use super::Transport;
    use crate::Error;

    /// Scripted in-memory transport
    #[derive(Debug, Default)]
    pub struct MockTransport {
        pub rx: VecDeque<u8>,
        pub tx: Vec<u8>,
        pub writes: usize,
        pub timer: u32,
    }

    impl MockTransport {
        pub fn new(rx: &[u8]) -> Self {
            Self { rx: rx.iter().cloned().collect(), ..Default::default() }
        }
    }

    impl Transport for MockTransport {
        type Error = ();

        fn read(&mut self, buff: &mut [u8], _timeout_ms: u32) -> Result<(), Error<()>> {
            for b in buff.iter_mut() {
                *b = self.rx.pop_front().ok_or(Error::ResponseTimeout)?;
            }
            Ok(())
        }

        fn write(&mut self, buff: &[u8], _timeout_ms: u32) -> Result<(), Error<()>> {
            self.writes += 1;
            self.tx.extend_from_slice(buff);
            Ok(())
        }

        fn start_timer(&mut self, timeout_ms: u32) {
            self.timer = timeout_ms;
        }

        fn remaining_time(&self) -> u32 {
            self.timer
        }
    }
}
