use hipsr_types::ACC_COUNT_REGISTER;

use crate::codec::CodecError;

#[derive(thiserror::Error, Debug)]
pub enum BoardError {
    #[error("board {host} unavailable: {reason}")]
    Unavailable { host: String, reason: String },
    #[error("read on board {host} aborted by shutdown")]
    Aborted { host: String },
    #[error("board {host} is missing devices required by flavour {flavour}: {missing:?}")]
    MissingDevices {
        host: String,
        flavour: String,
        missing: Vec<String>,
    },
    #[error("decode failure on board {host}: {source}")]
    Codec {
        host: String,
        source: CodecError,
    },
}

impl BoardError {
    pub fn unavailable(host: &str, reason: impl Into<String>) -> Self {
        BoardError::Unavailable {
            host: host.to_string(),
            reason: reason.into(),
        }
    }
}

/// Capability handle onto one signal-processing board.
///
/// The transport behind this trait is an external integration; everything in
/// this crate works against the trait only. Implementations are owned by one
/// pool worker at a time, hence `&mut self` everywhere.
pub trait BoardClient: Send {
    fn host(&self) -> &str;

    /// Connectivity probe. Returns `false` rather than failing.
    fn probe(&mut self) -> bool;

    /// Read one 32-bit register.
    fn read_int(&mut self, name: &str) -> Result<u32, BoardError>;

    /// Read a contiguous memory region.
    fn read_block(&mut self, name: &str, nbytes: usize) -> Result<Vec<u8>, BoardError>;

    /// Write one 32-bit register. Used by flavour configuration only.
    fn write_int(&mut self, name: &str, value: u32) -> Result<(), BoardError>;

    /// Names of all registers and memory regions on the running firmware.
    fn list_devices(&mut self) -> Result<Vec<String>, BoardError>;

    /// Program a firmware image onto the board.
    fn program(&mut self, firmware: &str) -> Result<(), BoardError>;

    /// Release the underlying transport.
    fn stop(&mut self);

    /// The monotonic accumulation counter.
    fn accumulator_count(&mut self) -> Result<u64, BoardError> {
        self.read_int(ACC_COUNT_REGISTER).map(u64::from)
    }
}
