//! Request and notification kind code tables.

/// Every request the dispatcher understands.
///
/// The integer codes are contiguous and in this exact order, so a table
/// lookup (or a match compiled to one) suffices for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestKind {
    Invalid = 0,
    Open,
    Close,
    Echo,
    New,
    Alias,
    GetAliases,
    Find,
    Get,
    Print,
    Set,
    Type,
    Name,
    Length,
    Flags,
    Info,
    Notify,
    NotifyCancel,
    GetValidationRequest,
    SendValidationResponse,
    OpenPrintSession,
    ClosePrintSession,
    GetFirst,
    GetNext,
    SetFlags,
    ClearFlags,
}

/// Number of request kinds, `Invalid` included.
pub const REQUEST_KIND_COUNT: usize = 26;

impl RequestKind {
    /// All kinds in wire-code order.
    pub const ALL: [RequestKind; REQUEST_KIND_COUNT] = [
        RequestKind::Invalid,
        RequestKind::Open,
        RequestKind::Close,
        RequestKind::Echo,
        RequestKind::New,
        RequestKind::Alias,
        RequestKind::GetAliases,
        RequestKind::Find,
        RequestKind::Get,
        RequestKind::Print,
        RequestKind::Set,
        RequestKind::Type,
        RequestKind::Name,
        RequestKind::Length,
        RequestKind::Flags,
        RequestKind::Info,
        RequestKind::Notify,
        RequestKind::NotifyCancel,
        RequestKind::GetValidationRequest,
        RequestKind::SendValidationResponse,
        RequestKind::OpenPrintSession,
        RequestKind::ClosePrintSession,
        RequestKind::GetFirst,
        RequestKind::GetNext,
        RequestKind::SetFlags,
        RequestKind::ClearFlags,
    ];

    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Lower-case name used for the per-operation statistics variables.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Open => "open",
            Self::Close => "close",
            Self::Echo => "echo",
            Self::New => "new",
            Self::Alias => "alias",
            Self::GetAliases => "get_aliases",
            Self::Find => "find",
            Self::Get => "get",
            Self::Print => "print",
            Self::Set => "set",
            Self::Type => "type",
            Self::Name => "name",
            Self::Length => "length",
            Self::Flags => "flags",
            Self::Info => "info",
            Self::Notify => "notify",
            Self::NotifyCancel => "notify_cancel",
            Self::GetValidationRequest => "get_validation_request",
            Self::SendValidationResponse => "send_validation_response",
            Self::OpenPrintSession => "open_print_session",
            Self::ClosePrintSession => "close_print_session",
            Self::GetFirst => "get_first",
            Self::GetNext => "get_next",
            Self::SetFlags => "set_flags",
            Self::ClearFlags => "clear_flags",
        }
    }
}

/// Notification kinds as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NotifyKind {
    /// Fan-out on every committed write
    Modified = 0,
    /// Queued delivery with at-most-one pending payload
    ModifiedQueue = 1,
    /// Subscriber computes the value on demand
    Calc = 2,
    /// Subscriber vets proposed writes
    Validate = 3,
    /// Subscriber renders the value for PRINT
    Print = 4,
    /// Tombstone; the slot can be reused
    None = 5,
}

impl NotifyKind {
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Modified),
            1 => Some(Self::ModifiedQueue),
            2 => Some(Self::Calc),
            3 => Some(Self::Validate),
            4 => Some(Self::Print),
            5 => Some(Self::None),
            _ => None,
        }
    }

    /// Bit used in a variable's notification mask.
    #[must_use]
    pub fn mask_bit(self) -> u32 {
        match self {
            Self::None => 0,
            other => 1 << other.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes_are_contiguous() {
        for (i, kind) in RequestKind::ALL.iter().enumerate() {
            assert_eq!(kind.code() as usize, i);
            assert_eq!(RequestKind::from_code(kind.code()), Some(*kind));
        }
        assert_eq!(RequestKind::from_code(REQUEST_KIND_COUNT as u16), None);
    }

    #[test]
    fn notify_kind_round_trip() {
        for code in 0..6 {
            let kind = NotifyKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(NotifyKind::from_code(6), None);
    }

    #[test]
    fn tombstone_has_no_mask_bit() {
        assert_eq!(NotifyKind::None.mask_bit(), 0);
        assert_eq!(NotifyKind::Modified.mask_bit(), 1);
        assert_eq!(NotifyKind::Calc.mask_bit(), 1 << 2);
    }
}
