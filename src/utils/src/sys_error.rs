use std::fmt;

/// Discriminates the failure classes of the memory core beyond a bare libc
/// code. `BusError` is the SIGBUS-equivalent used when a fault touches past
/// end-of-file; `Busy` marks a subsystem that has not been brought up yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysErrorKind {
    Libc,
    BusError,
    Busy,
}

#[derive(Debug, PartialEq, Eq)]
pub struct SysError {
    code: i32,
    desc: Option<String>,
    kind: SysErrorKind,
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SysError occured with code: {} {:?} {:?}",
            self.code, self.desc, self.kind
        )
    }
}

impl std::error::Error for SysError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl SysError {
    pub fn new(code: i32) -> Self {
        Self {
            code,
            desc: None,
            kind: SysErrorKind::Libc,
        }
    }

    pub fn new_with_msg(code: i32, msg: String) -> Self {
        Self {
            code,
            desc: Some(msg),
            kind: SysErrorKind::Libc,
        }
    }

    pub fn new_bus_error(code: i32) -> Self {
        Self {
            code,
            desc: None,
            kind: SysErrorKind::BusError,
        }
    }

    /// The allocator (or another subsystem) has not been brought up yet.
    pub fn busy() -> Self {
        Self {
            code: libc::EAGAIN,
            desc: None,
            kind: SysErrorKind::Busy,
        }
    }

    pub fn kind(&self) -> SysErrorKind {
        self.kind
    }

    pub fn code(&self) -> i32 {
        self.code
    }

}

#[macro_export]
macro_rules! err_libc {
    ($libc_code:expr) => {
        Err(SysError::new($libc_code))
    };
}

#[macro_export]
macro_rules! bail_libc {
    ($libc_code:expr) => {
        return Err(SysError::new($libc_code))
    };
}

pub type SysResult<T> = std::result::Result<T, SysError>;
