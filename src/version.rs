use std::cmp::Ordering;

/// A `major.minor.point` kernel release.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion {
    pub major: usize,
    pub minor: usize,
    pub point: usize,
}

impl KernelVersion {
    pub const fn new(major: usize, minor: usize, point: usize) -> Self {
        Self {
            major,
            minor,
            point,
        }
    }

    /// Parses the release out of a `linux_banner` string, e.g.
    /// `Linux version 5.10.43-android12-9-g1f5c8c2e (build@host) ...`.
    pub fn from_banner(banner: &str) -> Option<Self> {
        let release = banner
            .split("Linux version ")
            .nth(1)?
            .split_whitespace()
            .next()?;
        Self::from_release(release)
    }

    /// Parses `5.10.43-suffix`, `4.19` or `3.18.140`.
    pub fn from_release(release: &str) -> Option<Self> {
        let numeric = release
            .split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .next()?;

        let mut parts = numeric.split('.').filter(|s| !s.is_empty());

        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let point = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

        Some(Self::new(major, minor, point))
    }
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{}.{}.{}", self.major, self.minor, self.point)
    }
}

impl From<(usize, usize, usize)> for KernelVersion {
    fn from((major, minor, point): (usize, usize, usize)) -> Self {
        Self::new(major, minor, point)
    }
}

impl From<(usize, usize)> for KernelVersion {
    fn from((major, minor): (usize, usize)) -> Self {
        Self::new(major, minor, 0)
    }
}

impl PartialEq<(usize, usize, usize)> for KernelVersion {
    fn eq(&self, other: &(usize, usize, usize)) -> bool {
        *self == Self::from(*other)
    }
}

impl PartialOrd<(usize, usize, usize)> for KernelVersion {
    fn partial_cmp(&self, other: &(usize, usize, usize)) -> Option<Ordering> {
        Some(self.cmp(&Self::from(*other)))
    }
}
