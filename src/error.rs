use thiserror::Error;

/// Failure modes on the RS-485 side. Per-source events: counted and
/// logged, never fatal. The poller moves on to the next source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RtuError {
    #[error("no response within timeout")]
    Timeout,
    #[error("CRC mismatch")]
    Crc,
    #[error("frame too short")]
    Short,
    #[error("exception response (code {0})")]
    Exception(u8),
    #[error("unexpected function code")]
    BadFunc,
}

/// Modbus faults surfaced to TCP clients as exception responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ModbusFault {
    #[error("illegal function")]
    IllegalFunction,
    #[error("illegal data address")]
    IllegalAddress,
    #[error("illegal data value")]
    IllegalValue,
}

impl ModbusFault {
    pub fn exception_code(&self) -> u8 {
        match self {
            ModbusFault::IllegalFunction => 0x01,
            ModbusFault::IllegalAddress => 0x02,
            ModbusFault::IllegalValue => 0x03,
        }
    }
}

/// Creates an anyhow error with the current file and line number
#[macro_export]
macro_rules! file_error {
    ($($arg:tt)*) => {
        anyhow!(
            "[{}:{}] {}",
            std::path::Path::new(file!()).file_name().unwrap().to_string_lossy(),
            line!(),
            format!($($arg)*)
        )
    };
}
