use std::fmt;

/// Version of the binary envelope spoken by this build.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0, 0);

/// Semantic version carried at the front of every binary envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self { major, minor, patch }
    }

    /// Two versions are compatible iff their major components are equal.
    pub fn compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}
