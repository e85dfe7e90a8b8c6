//! Error types for RExOS
//!
//! Every failure the core can report, grouped into kinds. Synchronous misuse
//! errors are returned to the caller; transport errors travel back to the
//! waiting process inside a completion message.

/// Kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", target_arch = "arm"), derive(defmt::Format))]
#[repr(u16)]
pub enum Error {
    // ============ Configuration errors ============
    /// Handle is already open
    AlreadyConfigured = 1,
    /// Handle has not been opened
    NotConfigured = 2,
    /// Malformed request parameters
    InvalidParams = 3,
    /// Port, endpoint or vector number outside the supported range
    DeviceIndexOutOfRange = 4,
    /// Handle is owned by another process
    AccessDenied = 5,
    /// Request not understood by the driver
    NotSupported = 6,

    // ============ Resource exhaustion ============
    /// No free I/O descriptor
    OutOfMemory = 20,
    /// A fixed-capacity kernel table is full
    OutOfSystemMemory = 21,

    // ============ Concurrency conflicts ============
    /// A transfer is already in flight on the handle
    InProgress = 30,

    // ============ Transport/protocol errors ============
    /// Slave did not acknowledge
    Nak = 40,
    /// Receiver overrun
    Overflow = 41,
    /// Framing error
    InvalidFrame = 42,
    /// Parity error
    InvalidParity = 43,
    /// Noise detected on the line
    LineNoise = 44,
    /// Peripheral reported a fault it cannot classify
    Hardware = 45,
    /// CAN controller entered bus-off
    BusOff = 46,
    /// Lost bus arbitration
    ArbitrationLost = 47,

    // ============ Cancellation ============
    /// Request was flushed or its handle closed
    IoCancelled = 60,

    // ============ Internal ============
    /// Object is not in a state that allows the operation
    InvalidState = 70,
    /// Mailbox has no room for the message
    MailboxFull = 71,
}

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller misuse, detected synchronously
    Configuration,
    /// Allocation failure
    Resource,
    /// Second transfer requested while one is in flight
    Concurrency,
    /// Detected in interrupt context from hardware status
    Transport,
    /// Explicit flush/close
    Cancellation,
    /// Kernel bookkeeping violation
    Internal,
}

/// Result type alias for kernel operations
pub type Result<T> = core::result::Result<T, Error>;

const ALL: [Error; 20] = [
    Error::AlreadyConfigured,
    Error::NotConfigured,
    Error::InvalidParams,
    Error::DeviceIndexOutOfRange,
    Error::AccessDenied,
    Error::NotSupported,
    Error::OutOfMemory,
    Error::OutOfSystemMemory,
    Error::InProgress,
    Error::Nak,
    Error::Overflow,
    Error::InvalidFrame,
    Error::InvalidParity,
    Error::LineNoise,
    Error::Hardware,
    Error::BusOff,
    Error::ArbitrationLost,
    Error::IoCancelled,
    Error::InvalidState,
    Error::MailboxFull,
];

impl Error {
    /// Numeric error code
    #[inline]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Decode a numeric error code
    pub fn from_code(code: u16) -> Option<Error> {
        ALL.iter().copied().find(|e| e.code() == code)
    }

    /// Classify the error
    pub const fn kind(self) -> ErrorKind {
        match self {
            Error::AlreadyConfigured
            | Error::NotConfigured
            | Error::InvalidParams
            | Error::DeviceIndexOutOfRange
            | Error::AccessDenied
            | Error::NotSupported => ErrorKind::Configuration,
            Error::OutOfMemory | Error::OutOfSystemMemory => ErrorKind::Resource,
            Error::InProgress => ErrorKind::Concurrency,
            Error::Nak
            | Error::Overflow
            | Error::InvalidFrame
            | Error::InvalidParity
            | Error::LineNoise
            | Error::Hardware
            | Error::BusOff
            | Error::ArbitrationLost => ErrorKind::Transport,
            Error::IoCancelled => ErrorKind::Cancellation,
            Error::InvalidState | Error::MailboxFull => ErrorKind::Internal,
        }
    }

    /// Transport errors come from hardware and never indicate a software bug
    #[inline]
    pub const fn is_transport(self) -> bool {
        matches!(self.kind(), ErrorKind::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for e in ALL {
            assert_eq!(Error::from_code(e.code()), Some(e));
        }
        assert_eq!(Error::from_code(0), None);
        assert_eq!(Error::from_code(9999), None);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(Error::AlreadyConfigured.kind(), ErrorKind::Configuration);
        assert_eq!(Error::OutOfMemory.kind(), ErrorKind::Resource);
        assert_eq!(Error::InProgress.kind(), ErrorKind::Concurrency);
        assert_eq!(Error::BusOff.kind(), ErrorKind::Transport);
        assert_eq!(Error::IoCancelled.kind(), ErrorKind::Cancellation);
        assert!(Error::Nak.is_transport());
        assert!(!Error::IoCancelled.is_transport());
    }
}
