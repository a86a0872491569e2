use thiserror::Error;

/// Storage-level errors raised by the in-memory database.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImdbError {
    #[error("internal error")]
    Internal,

    #[error("out of memory")]
    Nomem,

    #[error("invalid handler")]
    InvalidHandler,

    #[error("invalid operation")]
    InvalidOperation,

    #[error("pages limit reached")]
    AllocPagesMax,

    #[error("invalid object size")]
    InvalidObjSize,

    #[error("invalid recycle storage")]
    InvalidRecycleStorage,

    #[error("invalid cursor access path")]
    CursorInvalidPath,

    #[error("no data found")]
    CursorNoDataFound,

    #[error("forall callback error")]
    CursorForallFunc,
}

/// TLV codec errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlvError {
    #[error("AVP is not a grouping value")]
    AvpNotGrouping,

    #[error("invalid AVP length")]
    AvpInvalidLen,

    #[error("invalid AVP data type")]
    AvpInvType,

    #[error("buffer overflow")]
    BufferOverflow,

    #[error("AVP out of enclosing bounds")]
    AvpOutOfBounds,

    #[error("end of data")]
    EndOfData,

    #[error("path error")]
    PathError,

    #[error("forall callback error")]
    ForallFunc,
}

/// Inline-key hash map errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdxError {
    #[error("buffer overflow")]
    BufferOverflow,

    #[error("entry already exists")]
    EntryExists,

    #[error("entry not found")]
    EntryNotFound,

    #[error("empty key")]
    NullEntry,
}

/// Service controller errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcsError {
    #[error("internal error")]
    Internal,

    #[error("service error")]
    ServiceError,

    #[error("not run")]
    NotRun,

    #[error("already run")]
    AlreadyRun,

    #[error("already exists")]
    AlreadyExists,

    #[error("not exists")]
    NotExists,

    #[error("invalid message type")]
    MsgTypeInvalid,

    #[error("invalid message")]
    InvalidMessage,
}

/// Shell (parser/evaluator) errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShError {
    #[error("internal error")]
    Internal,

    #[error("invalid handler")]
    InvalidHandler,

    #[error("function not exists")]
    FuncNotExists,

    #[error("function already exists")]
    FuncExists,

    #[error("invalid number")]
    ParseNumInvalid,

    #[error("invalid string")]
    ParseStrInvalid,

    #[error("invalid token")]
    ParseTokenInvalid,

    #[error("unclosed bracket")]
    ParseClosingBracket,

    #[error("operand missing")]
    ParseOperandMissing,

    #[error("unexpected operand")]
    ParseOperandUnexpected,

    #[error("out of buffer")]
    ParseOutOfBuffer,

    #[error("duplicate variable")]
    VariableExists,

    #[error("unknown variable")]
    VariableUndefined,

    #[error("invalid function")]
    EvalInvalidFunc,

    #[error("invalid argument type")]
    EvalInvalidArgType,

    #[error("memory allocation error")]
    Allocation,

    #[error("statement already exists")]
    StmtExists,

    #[error("statement not exists")]
    StmtNotExists,

    #[error("function call error")]
    FuncError,
}

/// UDP control channel errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpctlError {
    #[error("internal error")]
    Internal,

    #[error("requires secured messages")]
    ServerSecured,

    #[error("requires not secured messages")]
    ServerNotSecured,

    #[error("clients limit exceeded")]
    ClientsLimitExceeded,

    #[error("client not exists")]
    ClientNotExists,

    #[error("client must authenticate first")]
    ClientNoAuth,

    #[error("invalid message digest")]
    InvalidDigest,

    #[error("invalid packet length")]
    InvalidLength,

    #[error("invalid protocol command")]
    InvalidCommand,

    #[error("invalid message flags")]
    InvalidFlags,

    #[error("unsupported command")]
    UnsupportedCommand,

    #[error("decoding error")]
    DecodingError,
}

/// Scheduler errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    #[error("internal error")]
    Internal,

    #[error("memory allocation error")]
    Allocation,

    #[error("schedule parsing error")]
    ParseError,

    #[error("entry already exists")]
    EntryExists,

    #[error("entry not exists")]
    EntryNotExists,

    #[error("statement not exists")]
    StmtNotExists,

    #[error("statement error")]
    StmtError,

    #[error("entry source not exists")]
    EntrySrcNotExists,
}

/// NTP client errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtpError {
    #[error("internal error")]
    Internal,

    #[error("peer not resolved")]
    PeerUnresolved,

    #[error("invalid server packet")]
    InvalidPacket,
}

// Foreign-error collapses: resource pressure keeps its identity,
// everything else degrades to the caller's internal/service error.

impl From<ImdbError> for SvcsError {
    fn from(_: ImdbError) -> Self {
        SvcsError::Internal
    }
}

impl From<DtlvError> for SvcsError {
    fn from(_: DtlvError) -> Self {
        SvcsError::Internal
    }
}

impl From<ImdbError> for ShError {
    fn from(e: ImdbError) -> Self {
        match e {
            ImdbError::Nomem | ImdbError::AllocPagesMax => ShError::Allocation,
            _ => ShError::Internal,
        }
    }
}

impl From<IdxError> for ShError {
    fn from(e: IdxError) -> Self {
        match e {
            IdxError::BufferOverflow => ShError::Allocation,
            _ => ShError::Internal,
        }
    }
}

impl From<ImdbError> for SchedError {
    fn from(e: ImdbError) -> Self {
        match e {
            ImdbError::Nomem | ImdbError::AllocPagesMax => SchedError::Allocation,
            _ => SchedError::Internal,
        }
    }
}

impl From<DtlvError> for SchedError {
    fn from(_: DtlvError) -> Self {
        SchedError::Internal
    }
}

impl From<DtlvError> for UdpctlError {
    fn from(_: DtlvError) -> Self {
        UdpctlError::Internal
    }
}

impl From<SvcsError> for SchedError {
    fn from(_: SvcsError) -> Self {
        SchedError::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imdb_pressure_collapses_to_allocation() {
        assert_eq!(ShError::from(ImdbError::Nomem), ShError::Allocation);
        assert_eq!(ShError::from(ImdbError::AllocPagesMax), ShError::Allocation);
        assert_eq!(ShError::from(ImdbError::InvalidHandler), ShError::Internal);
        assert_eq!(SchedError::from(ImdbError::Nomem), SchedError::Allocation);
    }

    #[test]
    fn test_dtlv_collapses_to_internal() {
        assert_eq!(SvcsError::from(DtlvError::BufferOverflow), SvcsError::Internal);
        assert_eq!(UdpctlError::from(DtlvError::PathError), UdpctlError::Internal);
    }
}
