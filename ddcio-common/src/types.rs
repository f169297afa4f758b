use std::fmt;

/// Which driver surface an operation goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IoMode {
    /// Kernel `/dev/i2c-N` character device.
    #[default]
    I2c,
    /// A vendor display library abstracted behind the same interface.
    Vendor,
}

impl IoMode {
    pub const ALL: [Self; 2] = [Self::I2c, Self::Vendor];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Selects the maxtries value and try histogram used for a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationClass {
    WriteOnly,
    WriteRead,
    MultiPartRead,
    MultiPartWrite,
}

impl OperationClass {
    pub const COUNT: usize = 4;

    pub const ALL: [Self; Self::COUNT] =
        [Self::WriteOnly, Self::WriteRead, Self::MultiPartRead, Self::MultiPartWrite];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Initial maxtries for the class.
    pub const fn default_maxtries(self) -> u16 {
        match self {
            Self::WriteOnly => 4,
            Self::WriteRead => 10,
            Self::MultiPartRead | Self::MultiPartWrite => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::WriteOnly => "write only",
            Self::WriteRead => "write read",
            Self::MultiPartRead => "multi part read",
            Self::MultiPartWrite => "multi part write",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
