use std::path::PathBuf;

use rstest::fixture;

use super::TmpDir;
use crate::testapp::index::{self, AndroidApp, TestAppIndex};
use crate::testapp::{Policy, TestAppCatalogEntry, TestAppProvider, DEVICE_ADMIN_METADATA};

pub const DEVICE_ADMIN_APP: &str = "com.android.bedstead.testapp.DeviceAdminTestApp";
pub const EMPTY_APP: &str = "com.android.bedstead.testapp.EmptyTestApp";
pub const REMOTE_DPC_APP: &str = "com.android.bedstead.testapp.RemoteDpcTestApp";
pub const HELPER_APP: &str = "com.example.helper.HelperApp";

const FORCE_LOCK_XML: &str =
    "<device-admin><uses-policies><force-lock /></uses-policies></device-admin>";

fn admin_receiver(resource: bool) -> index::Receiver {
    index::Receiver {
        name: ".DeviceAdminReceiver".into(),
        metadata: vec![index::Metadata {
            name: DEVICE_ADMIN_METADATA.into(),
            value: if resource { "device_admin".into() } else { "".into() },
            resource: if resource { "true".into() } else { "".into() },
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// The apps behind [sample_catalog_entries], in their index form
pub fn sample_apps() -> Vec<AndroidApp> {
    vec![
        AndroidApp {
            package_name: EMPTY_APP.into(),
            label: "Empty".into(),
            min_sdk_version: 28,
            target_sdk_version: 30,
            test_only: true,
            metadata: vec![index::Metadata {
                name: "test-metadata-key".into(),
                value: "test-metadata-value".into(),
                ..Default::default()
            }],
            ..Default::default()
        },
        AndroidApp {
            package_name: REMOTE_DPC_APP.into(),
            label: "Remote DPC".into(),
            min_sdk_version: 28,
            target_sdk_version: 34,
            test_only: true,
            cross_profile: true,
            permissions: vec!["android.permission.INTERNET".into()],
            receivers: vec![admin_receiver(false)],
            ..Default::default()
        },
        AndroidApp {
            package_name: DEVICE_ADMIN_APP.into(),
            label: "Device Admin".into(),
            min_sdk_version: 28,
            target_sdk_version: 34,
            test_only: true,
            permissions: vec!["android.permission.INTERNET".into()],
            activities: vec![index::Activity {
                name: ".MainActivity".into(),
                exported: true,
                ..Default::default()
            }],
            receivers: vec![admin_receiver(true)],
            ..Default::default()
        },
        AndroidApp {
            package_name: HELPER_APP.into(),
            label: "Helper".into(),
            uses_shared_user_id: "com.example.shared".into(),
            min_sdk_version: 21,
            target_sdk_version: 29,
            services: vec![index::Service {
                name: ".HelperService".into(),
                ..Default::default()
            }],
            ..Default::default()
        },
    ]
}

/// A small catalog: two device admins (only `DeviceAdminTestApp` declares
/// `force-lock`), an app with metadata and one outside the bedstead package
/// prefix.
pub fn sample_catalog_entries() -> Vec<TestAppCatalogEntry> {
    sample_apps()
        .into_iter()
        .map(|app| {
            let mut entry =
                TestAppCatalogEntry::from_proto(app, None).expect("sample entries are valid");
            if entry.package_name == DEVICE_ADMIN_APP {
                entry.policies.insert(Policy::ForceLock);
                for r in entry.receivers.iter_mut() {
                    for m in r.metadata.iter_mut() {
                        m.resource = Some(FORCE_LOCK_XML.into());
                    }
                }
            }
            entry
        })
        .collect()
}

#[fixture]
pub fn sample_provider() -> TestAppProvider {
    TestAppProvider::from_entries(sample_catalog_entries(), PathBuf::from("/testapps/apks"))
}

/// Write the sample catalog as an index file plus its XML resources into
/// `dir`, returning the index path.
pub fn sample_index_file(dir: &TmpDir) -> PathBuf {
    dir.write_file("resources/device_admin.xml", FORCE_LOCK_XML);
    let bytes = TestAppIndex {
        apps: sample_apps(),
        ..Default::default()
    }
    .to_bytes()
    .expect("encode sample index");
    let path = dir.get_path().join("index.pb");
    std::fs::write(&path, bytes).expect("write sample index");
    path
}
