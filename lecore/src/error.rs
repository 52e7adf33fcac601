use core::fmt;

/// Errors returned by the link-layer core.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Packet specified an invalid length value or was too short.
    ///
    /// This indicates a protocol violation. For control PDUs, the peer is answered with an
    /// `LL_UNKNOWN_RSP`.
    InvalidLength,

    /// Invalid value supplied for field.
    InvalidValue,

    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// This is returned when the application tries to fit too much data into a PDU or other
    /// fixed-size buffer, and also when reaching EOF prematurely while reading data from a buffer.
    Eof,

    /// Parsing didn't consume the entire buffer.
    IncompleteParse,

    /// The connection handle does not refer to an established connection.
    UnknownConnection,

    /// No free task, connection block, or queue slot is available, or the scheduler cannot fit
    /// another connection into its slot budget.
    ResourceExhausted,

    /// A conflicting control procedure is already pending on the connection.
    ProcedureCollision,

    /// The operation is not valid in the current state (eg. encryption requested on a slave, or
    /// advertising while already advertising).
    InvalidState,

    /// No cryptographically secure randomness is currently available.
    EntropyUnavailable,

    /// A hardware error has halted the controller. It must be recreated.
    Halted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
            Error::IncompleteParse => "excess data in buffer",
            Error::UnknownConnection => "unknown connection handle",
            Error::ResourceExhausted => "out of resources",
            Error::ProcedureCollision => "conflicting control procedure pending",
            Error::InvalidState => "operation not permitted in current state",
            Error::EntropyUnavailable => "no secure entropy available",
            Error::Halted => "controller halted by hardware error",
        })
    }
}

enum_with_unknown! {
    /// Bluetooth error code, as carried in `LL_TERMINATE_IND`, `LL_REJECT_IND`, `LL_REJECT_EXT_IND`
    /// and reported to the host as a disconnection reason or procedure status.
    #[derive(Debug)]
    pub enum ErrorCode(u8) {
        Success = 0x00,
        UnknownConnectionId = 0x02,
        HardwareFailure = 0x03,
        PinOrKeyMissing = 0x06,
        ConnectionTimeout = 0x08,
        CommandDisallowed = 0x0C,
        InvalidParameters = 0x12,
        RemoteUserTerminated = 0x13,
        LocalHostTerminated = 0x16,
        UnsupportedRemoteFeature = 0x1A,
        InvalidLlParameters = 0x1E,
        UnspecifiedError = 0x1F,
        UnsupportedLlParameterValue = 0x20,
        LlResponseTimeout = 0x22,
        LlProcedureCollision = 0x23,
        LlPduNotAllowed = 0x24,
        InstantPassed = 0x28,
        DifferentTransactionCollision = 0x2A,
        UnacceptableConnectionParameters = 0x3B,
        MicFailure = 0x3D,
        ConnectionFailedToBeEstablished = 0x3E,
    }
}

impl Default for ErrorCode {
    fn default() -> Self {
        ErrorCode::Success
    }
}

/// Fatal, controller-wide failure reported through the hardware error notification.
///
/// The inner code follows the radio driver's failure codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HardwareError(pub u8);

impl HardwareError {
    /// The radio reported that the requested start time had already passed.
    pub const PAST_START_TRIGGER: Self = HardwareError(0x80);
    /// The radio rejected the command as malformed.
    pub const INVALID_RF_COMMAND: Self = HardwareError(0x83);
    /// No hardware timer was available to trigger the command.
    pub const NO_TIMER: Self = HardwareError(0x8E);
    /// The scheduler failed to program the radio for longer than the procedure timeout.
    pub const PROGRAMMING_TIMEOUT: Self = HardwareError(0xE0);
    /// Unexpected radio failure.
    pub const UNEXPECTED: Self = HardwareError(0xFF);
}

impl fmt::Display for HardwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hardware error {:#04x}", self.0)
    }
}
