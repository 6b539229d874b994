use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use quick_xml::events::Event;
use serde::{Deserialize, Serialize};

/// Device admin policies declared in an app's `<uses-policies>` resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Policy {
    LimitPassword,
    WatchLogin,
    ResetPassword,
    ForceLock,
    WipeData,
    SetGlobalProxy,
    ExpirePassword,
    EncryptedStorage,
    DisableCamera,
    DisableKeyguardFeatures,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LimitPassword => "limit-password",
            Self::WatchLogin => "watch-login",
            Self::ResetPassword => "reset-password",
            Self::ForceLock => "force-lock",
            Self::WipeData => "wipe-data",
            Self::SetGlobalProxy => "set-global-proxy",
            Self::ExpirePassword => "expire-password",
            Self::EncryptedStorage => "encrypted-storage",
            Self::DisableCamera => "disable-camera",
            Self::DisableKeyguardFeatures => "disable-keyguard-features",
        }
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "limit-password" => Self::LimitPassword,
            "watch-login" => Self::WatchLogin,
            "reset-password" => Self::ResetPassword,
            "force-lock" => Self::ForceLock,
            "wipe-data" => Self::WipeData,
            "set-global-proxy" => Self::SetGlobalProxy,
            "expire-password" => Self::ExpirePassword,
            "encrypted-storage" => Self::EncryptedStorage,
            "disable-camera" => Self::DisableCamera,
            "disable-keyguard-features" => Self::DisableKeyguardFeatures,
            _ => return Err(format!("unknown device admin policy `{}`", s)),
        })
    }
}

impl Display for Policy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Policy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Policy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Pull the policies out of the first `<uses-policies>` element in a device
/// admin XML resource.
///
/// Returns `None` if the resource has no `<uses-policies>` element at all.
/// Unknown child tags are ignored.
pub fn parse_uses_policies(content: &str) -> crate::Result<Option<Vec<Policy>>> {
    let mut xml = quick_xml::Reader::from_str(content);

    // Depth relative to <uses-policies>, 0 means we haven't seen it yet
    let mut depth = 0usize;
    let mut found = false;
    let mut policies = Vec::new();

    loop {
        let evt = xml
            .read_event()
            .map_err(|e| crate::Error::InvalidIndex(format!("bad policy resource: {}", e)))?;
        match evt {
            Event::Eof => break,
            Event::Start(bs) => {
                if depth > 0 {
                    if depth == 1 {
                        push_policy(&mut policies, bs.local_name().as_ref());
                    }
                    depth += 1;
                } else if !found && bs.local_name().as_ref() == b"uses-policies" {
                    found = true;
                    depth = 1;
                }
            }
            Event::Empty(bs) => {
                if depth == 1 {
                    push_policy(&mut policies, bs.local_name().as_ref());
                } else if depth == 0 && !found && bs.local_name().as_ref() == b"uses-policies" {
                    found = true;
                }
            }
            Event::End(_) if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
    }

    if !found {
        return Ok(None);
    }
    policies.sort();
    policies.dedup();
    Ok(Some(policies))
}

fn push_policy(into: &mut Vec<Policy>, tag: &[u8]) {
    match Policy::from_str(&String::from_utf8_lossy(tag)) {
        Ok(p) => into.push(p),
        Err(e) => log::debug!("{}", e),
    }
}
