//! ESP ROM bootloader command and response packets.
//!
//! All fields are little-endian and packed. Every request starts with an
//! 8 byte header (direction, command, size, checksum) followed by the
//! command specific fields, and data commands append a variable payload.

/// Direction byte for host to device requests
pub const REQUEST_DIRECTION: u8 = 0x00;

/// Direction byte for device to host responses
pub const RESPONSE_DIRECTION: u8 = 0x01;

/// Seed for the payload checksum
pub const CHECKSUM_SEED: u8 = 0xEF;

/// Length of the request header
pub const HEADER_LEN: usize = 8;

/// Length of a decoded response record
pub const RESPONSE_LEN: usize = 12;

/// Magic sequence carried by SYNC
pub const SYNC_SEQUENCE: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandId {
    /// Begin a flash download, erasing the target region
    FlashBegin = 0x02,

    /// Write one block of a flash download
    FlashData = 0x03,

    /// Finish a flash download, optionally leaving the loader
    FlashEnd = 0x04,

    /// Begin a RAM download
    MemBegin = 0x05,

    /// Finish a RAM download and optionally jump to an entry point
    MemEnd = 0x06,

    /// Write one block of a RAM download
    MemData = 0x07,

    /// Synchronise with the bootloader (also autobaud)
    Sync = 0x08,

    /// Read-modify-write a 32-bit register
    WriteReg = 0x09,

    /// Read a 32-bit register
    ReadReg = 0x0A,

    /// Attach the SPI flash
    SpiAttach = 0x0D,
}

impl CommandId {
    /// Size of the command specific field region, as declared in the header
    pub fn payload_size(&self) -> u16 {
        match self {
            CommandId::Sync => 36,
            CommandId::FlashBegin | CommandId::MemBegin => 16,
            CommandId::FlashData | CommandId::MemData => 16,
            CommandId::FlashEnd => 4,
            CommandId::MemEnd => 8,
            CommandId::WriteReg => 16,
            CommandId::ReadReg => 16,
            CommandId::SpiAttach => 8,
        }
    }
}

/// Failure codes reported by the device alongside a failed status
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceError {
    InvalidCrc,
    InvalidCommand,
    CommandFailed,
    FlashWriteErr,
    FlashReadErr,
    ReadLengthErr,
    DeflateError,
    Unknown(u8),
}

impl From<u8> for DeviceError {
    fn from(v: u8) -> Self {
        match v {
            0x05 => DeviceError::InvalidCrc,
            0x06 => DeviceError::InvalidCommand,
            0x07 => DeviceError::CommandFailed,
            0x08 => DeviceError::FlashWriteErr,
            0x09 => DeviceError::FlashReadErr,
            0x0A => DeviceError::ReadLengthErr,
            0x0B => DeviceError::DeflateError,
            other => DeviceError::Unknown(other),
        }
    }
}

impl core::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let s = match self {
            DeviceError::InvalidCrc => "INVALID_CRC",
            DeviceError::InvalidCommand => "INVALID_COMMAND",
            DeviceError::CommandFailed => "COMMAND_FAILED",
            DeviceError::FlashWriteErr => "FLASH_WRITE_ERR",
            DeviceError::FlashReadErr => "FLASH_READ_ERR",
            DeviceError::ReadLengthErr => "READ_LENGTH_ERR",
            DeviceError::DeflateError => "DEFLATE_ERROR",
            DeviceError::Unknown(_) => "UNKNOWN ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure(DeviceError),
}

/// Decoded response record
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub direction: u8,
    pub command: u8,
    pub size: u16,
    pub value: u32,
    pub status: Status,
}

impl Response {
    /// Parse a decoded response record
    pub fn parse(b: &[u8; RESPONSE_LEN]) -> Self {
        // Any non-zero status is a failure, not only 1
        let status = match b[8] {
            0 => Status::Success,
            _ => Status::Failure(DeviceError::from(b[9])),
        };

        Self {
            direction: b[0],
            command: b[1],
            size: u16::from_le_bytes([b[2], b[3]]),
            value: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            status,
        }
    }

    /// Check whether this response answers the provided command
    pub fn matches(&self, command: CommandId) -> bool {
        self.direction == RESPONSE_DIRECTION && self.command == command as u8
    }
}

/// Compute the XOR checksum over a data payload
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(CHECKSUM_SEED, |c, b| c ^ b)
}

/// Sequence bookkeeping for one begin / data / end transfer
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Session {
    sequence: u32,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset sequence numbering for a new transfer
    pub fn begin(&mut self) {
        self.sequence = 0;
    }

    /// Fetch the sequence number for the next data packet and advance
    pub fn next_sequence(&mut self) -> u32 {
        let s = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        s
    }

    /// Sequence number the next data packet will carry
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Bootloader requests
#[derive(Clone, Debug, PartialEq)]
pub enum Command<'a> {
    Sync,
    FlashBegin {
        offset: u32,
        erase_size: u32,
        block_size: u32,
        blocks: u32,
    },
    FlashData {
        data: &'a [u8],
    },
    FlashEnd {
        stay_in_loader: bool,
    },
    MemBegin {
        offset: u32,
        total_size: u32,
        block_size: u32,
        blocks: u32,
    },
    MemData {
        data: &'a [u8],
    },
    MemEnd {
        stay_in_loader: bool,
        entry_point: u32,
    },
    WriteReg {
        address: u32,
        value: u32,
        mask: u32,
        delay_us: u32,
    },
    ReadReg {
        address: u32,
    },
    SpiAttach {
        config: u32,
    },
}

/// Encoded request, ready for framing
#[derive(Clone, Debug, PartialEq)]
pub struct Packet<'a> {
    pub command: CommandId,
    pub header: Vec<u8>,
    pub data: Option<&'a [u8]>,
}

impl<'a> Command<'a> {
    pub fn id(&self) -> CommandId {
        match self {
            Command::Sync => CommandId::Sync,
            Command::FlashBegin { .. } => CommandId::FlashBegin,
            Command::FlashData { .. } => CommandId::FlashData,
            Command::FlashEnd { .. } => CommandId::FlashEnd,
            Command::MemBegin { .. } => CommandId::MemBegin,
            Command::MemData { .. } => CommandId::MemData,
            Command::MemEnd { .. } => CommandId::MemEnd,
            Command::WriteReg { .. } => CommandId::WriteReg,
            Command::ReadReg { .. } => CommandId::ReadReg,
            Command::SpiAttach { .. } => CommandId::SpiAttach,
        }
    }

    /// Encode the command, resetting the session on begin commands and
    /// consuming a sequence number on data commands.
    ///
    /// Field values are passed through unchecked.
    pub fn encode(&self, session: &mut Session) -> Packet<'a> {
        let id = self.id();

        let (fields, data): (Vec<u32>, Option<&'a [u8]>) = match *self {
            Command::Sync => (vec![], None),
            Command::FlashBegin { offset, erase_size, block_size, blocks } => {
                session.begin();
                (vec![erase_size, blocks, block_size, offset], None)
            }
            Command::MemBegin { offset, total_size, block_size, blocks } => {
                session.begin();
                (vec![total_size, blocks, block_size, offset], None)
            }
            Command::FlashData { data } | Command::MemData { data } => {
                let seq = session.next_sequence();
                (vec![data.len() as u32, seq, 0, 0], Some(data))
            }
            Command::FlashEnd { stay_in_loader } => (vec![stay_in_loader as u32], None),
            Command::MemEnd { stay_in_loader, entry_point } => {
                (vec![stay_in_loader as u32, entry_point], None)
            }
            Command::WriteReg { address, value, mask, delay_us } => {
                (vec![address, value, mask, delay_us], None)
            }
            Command::ReadReg { address } => (vec![address], None),
            Command::SpiAttach { config } => (vec![config, 0], None),
        };

        let csum = data.map(checksum).unwrap_or(0) as u32;

        let mut header = Vec::with_capacity(HEADER_LEN + 36);
        header.push(REQUEST_DIRECTION);
        header.push(id as u8);
        header.extend_from_slice(&id.payload_size().to_le_bytes());
        header.extend_from_slice(&csum.to_le_bytes());

        if let Command::Sync = self {
            header.extend_from_slice(&SYNC_SEQUENCE);
        }
        for f in fields {
            header.extend_from_slice(&f.to_le_bytes());
        }

        Packet { command: id, header, data }
    }
}
