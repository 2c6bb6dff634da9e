//! ESP Serial Bootloader.
//!
//! Host side of the ROM serial download protocol: SLIP framed command
//! packets sent over a [`Transport`], with matching of the framed
//! responses and mapping of device reported failures.

#[macro_use]
extern crate log;

extern crate nb;

extern crate embedded_hal;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod debug;
pub mod protocol;
pub mod slip;
pub mod transport;

pub use debug::{DebugLog, LogFacade, NoLog};
pub use protocol::{Command, CommandId, DeviceError, Response, Session, Status};
pub use transport::{HalTransport, SerialPort, Transport};

use protocol::RESPONSE_LEN;

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("timeout awaiting bootloader response")]
    ResponseTimeout,

    #[error("invalid bootloader response")]
    InvalidResponse,

    #[error("no matching response after {0} frames")]
    NoMatchingResponse(u32),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device into the bootloader on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="100"))]
    pub response_timeout_ms: u32,

    /// Timeout for flash begin, which erases the target region
    #[cfg_attr(feature = "structopt", structopt(long, default_value="10000"))]
    pub erase_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="1"))]
    pub poll_delay_ms: u32,

    /// Period to hold the boot strap after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value="50"))]
    pub init_delay_ms: u32,

    /// Maximum unrelated frames to discard while awaiting a response (0 for no limit)
    #[cfg_attr(feature = "structopt", structopt(long, default_value="0"))]
    pub max_response_frames: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 100,
            erase_timeout_ms: 10_000,
            poll_delay_ms: 1,
            init_delay_ms: 50,
            max_response_frames: 0,
        }
    }
}

pub struct Programmer<T, L = NoLog> {
    options: Options,
    port: T,
    session: Session,
    log: L,
}

impl <T> Programmer<T, NoLog>
where
    T: Transport,
{
    /// Create a new programmer instance
    pub fn new(port: T, options: Options) -> Self {
        Self::with_log(port, options, NoLog)
    }
}

impl <T, L> Programmer<T, L>
where
    T: Transport,
    L: DebugLog,
{
    /// Create a new programmer instance with a diagnostic output hook
    pub fn with_log(port: T, options: Options, log: L) -> Self {
        Self{ options, port, session: Session::new(), log }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Fetch the current transfer session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Release the underlying transport
    pub fn free(self) -> T {
        self.port
    }

    /// Reset into the bootloader (unless disabled) and synchronise
    pub fn init(&mut self) -> Result<(), Error<T::Error>> {
        if !self.options.no_reset {
            self.port.enter_bootloader(self.options.init_delay_ms)?;
        }

        debug!("Sending sync");
        self.sync()
    }

    pub fn sync(&mut self) -> Result<(), Error<T::Error>> {
        self.command(Command::Sync).map(|_| ())
    }

    /// Begin a flash download, resetting the sequence counter
    pub fn flash_begin(&mut self, offset: u32, erase_size: u32, block_size: u32, blocks: u32)
    -> Result<(), Error<T::Error>> {
        self.command(Command::FlashBegin{ offset, erase_size, block_size, blocks }).map(|_| ())
    }

    pub fn flash_data(&mut self, data: &[u8]) -> Result<(), Error<T::Error>> {
        self.command(Command::FlashData{ data }).map(|_| ())
    }

    pub fn flash_end(&mut self, stay_in_loader: bool) -> Result<(), Error<T::Error>> {
        self.command(Command::FlashEnd{ stay_in_loader }).map(|_| ())
    }

    /// Begin a RAM download, resetting the sequence counter
    pub fn mem_begin(&mut self, offset: u32, total_size: u32, block_size: u32, blocks: u32)
    -> Result<(), Error<T::Error>> {
        self.command(Command::MemBegin{ offset, total_size, block_size, blocks }).map(|_| ())
    }

    pub fn mem_data(&mut self, data: &[u8]) -> Result<(), Error<T::Error>> {
        self.command(Command::MemData{ data }).map(|_| ())
    }

    pub fn mem_end(&mut self, stay_in_loader: bool, entry_point: u32) -> Result<(), Error<T::Error>> {
        self.command(Command::MemEnd{ stay_in_loader, entry_point }).map(|_| ())
    }

    pub fn write_reg(&mut self, address: u32, value: u32, mask: u32, delay_us: u32)
    -> Result<(), Error<T::Error>> {
        self.command(Command::WriteReg{ address, value, mask, delay_us }).map(|_| ())
    }

    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error<T::Error>> {
        self.command(Command::ReadReg{ address })
    }

    pub fn spi_attach(&mut self, config: u32) -> Result<(), Error<T::Error>> {
        self.command(Command::SpiAttach{ config }).map(|_| ())
    }

    /// Send a command and await its response, returning the response value
    pub fn command(&mut self, command: Command) -> Result<u32, Error<T::Error>> {
        let packet = command.encode(&mut self.session);

        let timeout = match packet.command {
            CommandId::FlashBegin => self.options.erase_timeout_ms,
            _ => self.options.response_timeout_ms,
        };
        self.port.start_timer(timeout);

        trace!("Sending {:?} ({} byte header, {} byte payload)",
            packet.command, packet.header.len(), packet.data.map(|d| d.len()).unwrap_or(0));

        match packet.data {
            Some(d) => slip::send_frame(&mut self.port, &[&packet.header[..], d])?,
            None => slip::send_frame(&mut self.port, &[&packet.header[..]])?,
        }

        self.await_response(packet.command)
    }

    fn await_response(&mut self, command: CommandId) -> Result<u32, Error<T::Error>> {
        let mut discarded = 0;

        let resp = loop {
            let mut buff = [0u8; RESPONSE_LEN];
            slip::receive(&mut self.port, &mut buff)?;

            let resp = Response::parse(&buff);
            if resp.matches(command) {
                break resp;
            }

            debug!("Discarding unrelated frame (direction: 0x{:02x} command: 0x{:02x})",
                resp.direction, resp.command);

            if self.options.max_response_frames != 0 && discarded >= self.options.max_response_frames {
                error!("No response to {:?} after {} frames", command, discarded + 1);
                return Err(Error::NoMatchingResponse(discarded + 1))
            }
            discarded += 1;
        };

        match resp.status {
            Status::Success => Ok(resp.value),
            Status::Failure(e) => {
                warn!("Command {:?} failed: {}", command, e);
                self.log.debug_print(&e.to_string());
                Err(Error::InvalidResponse)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::protocol::{checksum, HEADER_LEN, RESPONSE_DIRECTION};
    use crate::transport::mock::MockTransport;

    fn response(command: CommandId, value: u32, status: u8, error: u8) -> Vec<u8> {
        let mut r = vec![RESPONSE_DIRECTION, command as u8, 2, 0];
        r.extend_from_slice(&value.to_le_bytes());
        r.extend_from_slice(&[status, error, 0, 0]);

        let mut m = MockTransport::default();
        slip::send_frame(&mut m, &[&r[..]]).unwrap();
        m.tx
    }

    fn ok(command: CommandId) -> Vec<u8> {
        response(command, 0, 0, 0)
    }

    fn programmer(rx: &[u8]) -> Programmer<MockTransport> {
        Programmer::new(MockTransport::new(rx), Options::default())
    }

    /// Split transmitted bytes into decoded frames
    fn sent_frames(tx: &[u8]) -> Vec<Vec<u8>> {
        let mut m = MockTransport::new(tx);
        let mut frames = vec![];

        while !m.rx.is_empty() {
            let mut f = vec![];
            assert_eq!(m.rx.pop_front(), Some(slip::END));
            loop {
                match m.rx.pop_front().unwrap() {
                    slip::END => break,
                    slip::ESC => match m.rx.pop_front().unwrap() {
                        slip::ESC_END => f.push(slip::END),
                        slip::ESC_ESC => f.push(slip::ESC),
                        v => panic!("bad escape 0x{:02x}", v),
                    },
                    v => f.push(v),
                }
            }
            frames.push(f);
        }

        frames
    }

    fn sequence(frame: &[u8]) -> u32 {
        u32::from_le_bytes([frame[12], frame[13], frame[14], frame[15]])
    }

    #[test]
    fn sync() {
        let mut p = programmer(&ok(CommandId::Sync));
        p.sync().unwrap();

        let m = p.free();
        let frames = sent_frames(&m.tx);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..4], &[0x00, 0x08, 36, 0]);
        assert_eq!(&frames[0][HEADER_LEN..], &protocol::SYNC_SEQUENCE[..]);
        assert_eq!(m.timer, Options::default().response_timeout_ms);
    }

    #[test]
    fn read_reg_value() {
        let mut p = programmer(&response(CommandId::ReadReg, 0xDEAD_BEEF, 0, 0));
        assert_eq!(p.read_reg(0x6000_1000), Ok(0xDEAD_BEEF));
    }

    #[test]
    fn discards_unrelated_frames() {
        let mut rx = response(CommandId::Sync, 0x1111, 0, 0);
        rx.extend(response(CommandId::ReadReg, 0x2222, 0, 0));

        let mut p = programmer(&rx);
        assert_eq!(p.read_reg(0), Ok(0x2222));
    }

    #[test]
    fn discards_stale_sync_while_awaiting_flash_begin() {
        let mut rx = ok(CommandId::Sync);
        rx.extend(ok(CommandId::FlashBegin));

        let mut p = programmer(&rx);
        p.flash_begin(0, 0x1000, 0x400, 4).unwrap();

        let m = p.free();
        assert!(m.rx.is_empty());
        assert_eq!(m.timer, Options::default().erase_timeout_ms);
    }

    #[test]
    fn discards_request_direction_frames() {
        let mut echo = vec![0x00, CommandId::Sync as u8, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut m = MockTransport::default();
        slip::send_frame(&mut m, &[&echo[..]]).unwrap();
        echo = m.tx;
        echo.extend(ok(CommandId::Sync));

        let mut p = programmer(&echo);
        p.sync().unwrap();
    }

    #[test]
    fn bounded_discard() {
        let mut rx = ok(CommandId::Sync);
        rx.extend(ok(CommandId::Sync));
        rx.extend(ok(CommandId::Sync));
        rx.extend(ok(CommandId::FlashEnd));

        let options = Options{ max_response_frames: 2, ..Default::default() };
        let mut p = Programmer::new(MockTransport::new(&rx), options);
        assert_eq!(p.flash_end(false), Err(Error::NoMatchingResponse(3)));
    }

    #[test]
    fn discard_limit_is_inclusive() {
        let mut rx = ok(CommandId::Sync);
        rx.extend(ok(CommandId::FlashEnd));

        let options = Options{ max_response_frames: 1, ..Default::default() };
        let mut p = Programmer::new(MockTransport::new(&rx), options);
        assert_eq!(p.flash_end(false), Ok(()));

        let mut rx = ok(CommandId::Sync);
        rx.extend(ok(CommandId::ReadReg));
        rx.extend(response(CommandId::FlashEnd, 0, 0, 0));

        let options = Options{ max_response_frames: 2, ..Default::default() };
        let mut p = Programmer::new(MockTransport::new(&rx), options);
        assert_eq!(p.flash_end(false), Ok(()));
        assert!(p.free().rx.is_empty());
    }

    #[test]
    fn failure_status_is_invalid_response() {
        let messages = Rc::new(RefCell::new(Vec::new()));
        let m = messages.clone();

        let mut p = Programmer::with_log(
            MockTransport::new(&response(CommandId::FlashData, 0, 1, 0x05)),
            Options::default(),
            move |s: &str| m.borrow_mut().push(s.to_string()),
        );

        assert_eq!(p.flash_data(&[1, 2, 3]), Err(Error::InvalidResponse));
        assert_eq!(*messages.borrow(), vec!["INVALID_CRC".to_string()]);
    }

    #[test]
    fn unknown_failure_code() {
        let mut p = programmer(&response(CommandId::SpiAttach, 0, 1, 0x77));
        assert_eq!(p.spi_attach(0), Err(Error::InvalidResponse));
    }

    #[test]
    fn transport_failure_propagates() {
        let mut p = programmer(&[]);
        assert_eq!(p.write_reg(0, 0, 0xFFFF_FFFF, 0), Err(Error::ResponseTimeout));
    }

    #[test]
    fn corrupt_response_is_invalid() {
        let mut rx = vec![slip::END, 0x01, slip::ESC, 0x00];
        rx.extend_from_slice(&[0u8; 12]);

        let mut p = programmer(&rx);
        assert_eq!(p.sync(), Err(Error::InvalidResponse));
    }

    #[test]
    fn flash_sequence_numbers() {
        let mut rx = ok(CommandId::FlashBegin);
        for _ in 0..3 {
            rx.extend(ok(CommandId::FlashData));
        }
        rx.extend(ok(CommandId::FlashBegin));
        rx.extend(ok(CommandId::FlashData));
        rx.extend(ok(CommandId::FlashEnd));

        let mut p = programmer(&rx);
        p.flash_begin(0x10000, 0x3000, 0x1000, 3).unwrap();
        for _ in 0..3 {
            p.flash_data(&[0u8; 16]).unwrap();
        }
        assert_eq!(p.session().sequence(), 3);

        p.flash_begin(0x10000, 0x1000, 0x1000, 1).unwrap();
        p.flash_data(&[0u8; 16]).unwrap();
        p.flash_end(true).unwrap();

        let frames = sent_frames(&p.free().tx);
        let seqs: Vec<u32> = frames
            .iter()
            .filter(|f| f[1] == CommandId::FlashData as u8)
            .map(|f| sequence(f))
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 0]);
    }

    #[test]
    fn mem_download() {
        let mut rx = ok(CommandId::MemBegin);
        rx.extend(ok(CommandId::MemData));
        rx.extend(ok(CommandId::MemData));
        rx.extend(ok(CommandId::MemEnd));

        let mut p = programmer(&rx);
        p.mem_begin(0x4010_0000, 8, 4, 2).unwrap();
        p.mem_data(&[0xC0, 0xDB, 0x00, 0x01]).unwrap();
        p.mem_data(&[0x02, 0x03, 0x04, 0x05]).unwrap();
        p.mem_end(false, 0x4010_0004).unwrap();

        let frames = sent_frames(&p.free().tx);
        assert_eq!(frames.len(), 4);
        assert_eq!(&frames[1][HEADER_LEN + 16..], &[0xC0, 0xDB, 0x00, 0x01]);
        assert_eq!(sequence(&frames[2]), 1);
        assert_eq!(frames[3][1], CommandId::MemEnd as u8);
    }

    #[test]
    fn flash_data_frame_roundtrip() {
        let payload = [0x01, 0x02, 0x03, 0x04];
        let mut p = programmer(&ok(CommandId::FlashData));
        p.flash_data(&payload).unwrap();

        let m = p.free();
        // header and payload share one frame
        assert_eq!(m.tx.iter().filter(|b| **b == slip::END).count(), 2);

        let frame = &sent_frames(&m.tx)[0];
        assert_eq!(frame.len(), HEADER_LEN + 16 + payload.len());
        assert_eq!(frame[4], checksum(&payload));
        assert_eq!(frame[4], 0xEF ^ 0x01 ^ 0x02 ^ 0x03 ^ 0x04);
        assert_eq!(&frame[HEADER_LEN + 16..], &payload);
    }

    #[test]
    fn init_without_reset() {
        let options = Options{ no_reset: true, ..Default::default() };
        let mut p = Programmer::with_log(MockTransport::new(&ok(CommandId::Sync)), options, LogFacade);
        p.init().unwrap();
    }
}
