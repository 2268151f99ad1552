#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessType {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl std::fmt::Debug for AccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { "r" } else { "-" },
            if self.write { "w" } else { "-" },
            if self.execute { "x" } else { "-" }
        )
    }
}

impl AccessType {
    pub const fn read() -> Self {
        Self {
            read: true,
            write: false,
            execute: false,
        }
    }

    pub const fn write() -> Self {
        Self {
            read: false,
            write: true,
            execute: false,
        }
    }

    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            execute: false,
        }
    }

    pub const fn read_execute() -> Self {
        Self {
            read: true,
            write: false,
            execute: true,
        }
    }

    pub fn is_superset_of(&self, other: AccessType) -> bool {
        if !self.read && other.read {
            false
        } else if !self.write && other.write {
            false
        } else {
            self.execute || !other.execute
        }
    }

}
