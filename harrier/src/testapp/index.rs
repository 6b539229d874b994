//! Reading and writing the binary test app index.
//!
//! The messages are generated at build time from
//! `protos/testapp_index.proto`.

use protobuf::Message;

include!(concat!(env!("OUT_DIR"), "/protos/mod.rs"));

pub use testapp_index::{
    Activity, AndroidApp, IntentFilter, Metadata, Permission, Receiver, Service, TestAppIndex,
};

impl TestAppIndex {
    pub fn parse(bytes: &[u8]) -> crate::Result<Self> {
        Ok(Self::parse_from_bytes(bytes)?)
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(self.write_to_bytes()?)
    }

    /// Read an index from its protobuf JSON form, as fed to `catalog pack`
    pub fn from_json(content: &str) -> crate::Result<Self> {
        protobuf_json_mapping::parse_from_str(content)
            .map_err(|e| crate::Error::InvalidIndex(e.to_string()))
    }
}

impl From<&str> for Permission {
    fn from(name: &str) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}
