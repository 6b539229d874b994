use std::fmt::{self, Display, Formatter};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Version {
    pub major: usize,
    pub minor: usize,
    pub patch: usize,
    pub extra: Option<&'static str>,
}

include!(concat!(env!("OUT_DIR"), "/current_version.rs"));

impl Default for Version {
    fn default() -> Self {
        VERSION
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(extra) = self.extra {
            write!(f, "-{}", extra)?;
        }
        Ok(())
    }
}
