use std::collections::BTreeSet;
use std::path::Path;

use lazy_static::lazy_static;
use log::{debug, trace};
use regex::Regex;

use super::{Device, Owner, OwnerKind, UserInfo};
use crate::adb::Adb;
use crate::command::{quote, CmdOutput};
use crate::config::RetryConfig;
use crate::precondition::UserId;
use crate::utils::path_str;

/// Broadcast action the test app admin receivers handle to change delegated
/// scopes
pub const SET_DELEGATED_SCOPES_ACTION: &str = "com.android.bedstead.harrier.SET_DELEGATED_SCOPES";

/// Broadcast action answered with the current scopes as the result data
pub const GET_DELEGATED_SCOPES_ACTION: &str = "com.android.bedstead.harrier.GET_DELEGATED_SCOPES";

/// `Activity.RESULT_OK`, what the admin receiver reports on success
const BROADCAST_RESULT_OK: i32 = -1;

lazy_static! {
    static ref USER_LINE: Regex = Regex::new(
        r"id=(\d+),\s*name=([^,]*),\s*type=([^,\s]+)(?:.*?parentId=(\d+))?"
    )
    .unwrap();
    static ref OWNER_LINE: Regex =
        Regex::new(r"User\s+(\d+):\s+admin=([^,\s]+),(DeviceOwner|ProfileOwner)").unwrap();
    static ref CREATED_USER: Regex = Regex::new(r"Success: created user id (\d+)").unwrap();
    static ref USER_INFO_HEADER: Regex = Regex::new(r"^\s*UserInfo\{(\d+):").unwrap();
    static ref BROADCAST_RESULT: Regex =
        Regex::new(r#"Broadcast completed: result=(-?\d+)(?:, data="([^"]*)")?"#).unwrap();
}

/// A [Device] driven through `adb shell`.
pub struct AdbDevice {
    adb: Box<dyn Adb>,
    transient_markers: Vec<String>,
}

impl AdbDevice {
    pub fn new(adb: Box<dyn Adb>, retry: &RetryConfig) -> Self {
        Self {
            adb,
            transient_markers: retry.transient_markers.clone(),
        }
    }

    fn is_transient(&self, text: &str) -> bool {
        self.transient_markers.iter().any(|m| text.contains(m.as_str()))
    }

    /// Sort a failed operation into transient or fatal
    fn failure(&self, operation: &str, message: String) -> crate::Error {
        if self.is_transient(&message) {
            crate::Error::TransientProvisioning {
                operation: operation.into(),
                message,
            }
        } else {
            crate::Error::FatalProvisioning {
                operation: operation.into(),
                message,
            }
        }
    }

    /// Check the output of a command that changes the device. Tools like
    /// `pm` and `dpm` report some failures with a zero exit status so the
    /// output is checked as well.
    fn check(&self, operation: &str, out: CmdOutput) -> crate::Result<CmdOutput> {
        let text = out.combined_output();
        trace!("{} -> {}", operation, text);
        let failed = !out.ok()
            || text.starts_with("Error")
            || text.contains("Failure")
            || text.contains("Exception")
            || self.is_transient(&text);
        if failed {
            return Err(self.failure(operation, text));
        }
        Ok(out)
    }

    /// Run a command that changes the device
    fn run(&self, shell_cmd: &str) -> crate::Result<CmdOutput> {
        let out = self.adb.shell(shell_cmd)?;
        self.check(shell_cmd, out)
    }

    fn run_stdout(&self, shell_cmd: &str) -> crate::Result<String> {
        Ok(self.run(shell_cmd)?.stdout_utf8_lossy().into_owned())
    }

    /// Run a read only command. Dumps legitimately mention exceptions so
    /// only the exit status counts.
    fn query(&self, shell_cmd: &str) -> crate::Result<String> {
        let out = self.adb.shell(shell_cmd)?;
        trace!("{} -> {}", shell_cmd, out.combined_output());
        if !out.ok() {
            return Err(self.failure(shell_cmd, out.combined_output()));
        }
        Ok(out.stdout_utf8_lossy().into_owned())
    }

    fn get_setting(&self, cmd: &str) -> crate::Result<Option<String>> {
        let out = self.query(cmd)?;
        let value = out.trim_end_matches(['\r', '\n']);
        Ok(if value == "null" {
            None
        } else {
            Some(value.to_string())
        })
    }

    /// Send `action` to the admin receiver and return the result data
    fn admin_broadcast(
        &self,
        action: &str,
        admin: &str,
        package: &str,
        user: UserId,
        scopes: Option<&[String]>,
    ) -> crate::Result<String> {
        let mut cmd = format!(
            "am broadcast --user {} -a {} -n {} --es package {}",
            user,
            action,
            quote(admin),
            quote(package)
        );
        if let Some(scopes) = scopes.filter(|s| !s.is_empty()) {
            cmd.push_str(" --esa scopes ");
            cmd.push_str(&quote(&scopes.join(",")));
        }
        let out = match scopes {
            Some(_) => self.run_stdout(&cmd)?,
            None => self.query(&cmd)?,
        };
        let caps = BROADCAST_RESULT.captures(&out);
        let code = caps
            .as_ref()
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<i32>().ok());
        match code {
            Some(BROADCAST_RESULT_OK) => Ok(caps
                .and_then(|c| c.get(2))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default()),
            _ => Err(self.failure(&cmd, format!("admin rejected {}: {}", action, out.trim()))),
        }
    }
}

impl Device for AdbDevice {
    fn users(&self) -> crate::Result<Vec<UserInfo>> {
        let out = self.query("cmd user list -v")?;
        Ok(parse_users(&out))
    }

    fn current_user(&self) -> crate::Result<UserId> {
        let cmd = "am get-current-user";
        let out = self.query(cmd)?;
        out.trim()
            .parse()
            .map_err(|_| self.failure(cmd, format!("unexpected output: {}", out.trim())))
    }

    fn create_user(&self, name: &str, profile_of: Option<UserId>) -> crate::Result<UserId> {
        let cmd = match profile_of {
            Some(parent) => format!("pm create-user --profileOf {} --managed {}", parent, quote(name)),
            None => format!("pm create-user {}", quote(name)),
        };
        let out = self.run_stdout(&cmd)?;
        let id = CREATED_USER
            .captures(&out)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| self.failure(&cmd, format!("unexpected output: {}", out.trim())))?;
        debug!("created user {} ({})", id, name);
        Ok(id)
    }

    fn remove_user(&self, user: UserId) -> crate::Result<()> {
        self.run(&format!("pm remove-user {}", user))?;
        Ok(())
    }

    fn is_installed(&self, package: &str, user: UserId) -> crate::Result<bool> {
        let out = self.query(&format!("pm list packages --user {} {}", user, quote(package)))?;
        Ok(out
            .lines()
            .filter_map(|l| l.trim().strip_prefix("package:"))
            .any(|p| p == package))
    }

    fn install(&self, apk: &Path, user: UserId) -> crate::Result<()> {
        let apk = path_str(apk)?;
        let out = self.adb.install(apk, Some(user))?;
        self.check(&format!("install {} for user {}", apk, user), out)?;
        Ok(())
    }

    fn uninstall(&self, package: &str, user: UserId) -> crate::Result<()> {
        self.run(&format!("pm uninstall --user {} {}", user, quote(package)))?;
        Ok(())
    }

    fn owners(&self) -> crate::Result<Vec<Owner>> {
        let out = self.query("dpm list-owners")?;
        Ok(parse_owners(&out))
    }

    fn set_device_owner(&self, component: &str, user: UserId) -> crate::Result<()> {
        self.run(&format!("dpm set-device-owner --user {} {}", user, quote(component)))?;
        Ok(())
    }

    fn set_profile_owner(&self, component: &str, user: UserId) -> crate::Result<()> {
        self.run(&format!("dpm set-profile-owner --user {} {}", user, quote(component)))?;
        Ok(())
    }

    fn remove_active_admin(&self, component: &str, user: UserId) -> crate::Result<()> {
        self.run(&format!("dpm remove-active-admin --user {} {}", user, quote(component)))?;
        Ok(())
    }

    fn user_restriction(&self, key: &str, user: UserId) -> crate::Result<bool> {
        let out = self.query("dumpsys user")?;
        Ok(parse_user_restrictions(&out, user).contains(key))
    }

    fn set_user_restriction(&self, key: &str, user: UserId, value: bool) -> crate::Result<()> {
        self.run(&format!(
            "pm set-user-restriction --user {} {} {}",
            user,
            quote(key),
            if value { 1 } else { 0 }
        ))?;
        Ok(())
    }

    fn global_setting(&self, key: &str) -> crate::Result<Option<String>> {
        self.get_setting(&format!("settings get global {}", quote(key)))
    }

    fn put_global_setting(&self, key: &str, value: &str) -> crate::Result<()> {
        self.run(&format!("settings put global {} {}", quote(key), quote(value)))?;
        Ok(())
    }

    fn delete_global_setting(&self, key: &str) -> crate::Result<()> {
        self.run(&format!("settings delete global {}", quote(key)))?;
        Ok(())
    }

    fn secure_setting(&self, key: &str, user: UserId) -> crate::Result<Option<String>> {
        self.get_setting(&format!("settings --user {} get secure {}", user, quote(key)))
    }

    fn put_secure_setting(&self, key: &str, user: UserId, value: &str) -> crate::Result<()> {
        self.run(&format!(
            "settings --user {} put secure {} {}",
            user,
            quote(key),
            quote(value)
        ))?;
        Ok(())
    }

    fn delete_secure_setting(&self, key: &str, user: UserId) -> crate::Result<()> {
        self.run(&format!("settings --user {} delete secure {}", user, quote(key)))?;
        Ok(())
    }

    fn delegated_scopes(&self, admin: &str, package: &str, user: UserId) -> crate::Result<Vec<String>> {
        let data = self.admin_broadcast(GET_DELEGATED_SCOPES_ACTION, admin, package, user, None)?;
        Ok(data
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect())
    }

    fn set_delegated_scopes(
        &self,
        admin: &str,
        package: &str,
        user: UserId,
        scopes: &[String],
    ) -> crate::Result<()> {
        self.admin_broadcast(SET_DELEGATED_SCOPES_ACTION, admin, package, user, Some(scopes))?;
        Ok(())
    }
}

/// Parse the output of `cmd user list -v`
fn parse_users(out: &str) -> Vec<UserInfo> {
    out.lines()
        .filter_map(|l| USER_LINE.captures(l))
        .filter_map(|caps| {
            Some(UserInfo {
                id: caps.get(1)?.as_str().parse().ok()?,
                name: caps.get(2)?.as_str().trim().to_string(),
                user_type: caps.get(3)?.as_str().to_string(),
                parent: caps.get(4).and_then(|m| m.as_str().parse().ok()),
            })
        })
        .collect()
}

/// Parse the output of `dpm list-owners`
fn parse_owners(out: &str) -> Vec<Owner> {
    OWNER_LINE
        .captures_iter(out)
        .filter_map(|caps| {
            Some(Owner {
                user: caps.get(1)?.as_str().parse().ok()?,
                component: caps.get(2)?.as_str().to_string(),
                kind: match caps.get(3)?.as_str() {
                    "DeviceOwner" => OwnerKind::DeviceOwner,
                    _ => OwnerKind::ProfileOwner,
                },
            })
        })
        .collect()
}

/// Pull the restrictions in effect for `user` out of `dumpsys user`.
///
/// Prefers the "Effective restrictions" block and falls back to the plain
/// "Restrictions" block older releases print.
fn parse_user_restrictions(out: &str, user: UserId) -> BTreeSet<String> {
    let mut in_user = false;
    let mut effective: Option<BTreeSet<String>> = None;
    let mut plain: Option<BTreeSet<String>> = None;
    // (is effective block, header indent, collected)
    let mut current: Option<(bool, usize, BTreeSet<String>)> = None;

    for line in out.lines() {
        if let Some(caps) = USER_INFO_HEADER.captures(line) {
            if in_user {
                break;
            }
            in_user = caps.get(1).and_then(|m| m.as_str().parse::<UserId>().ok()) == Some(user);
            continue;
        }
        if !in_user {
            continue;
        }

        let indent = line.len() - line.trim_start().len();
        let trimmed = line.trim();

        if let Some((_, header_indent, set)) = current.as_mut() {
            if indent > *header_indent && !trimmed.is_empty() {
                if trimmed != "null" && trimmed != "none" {
                    set.insert(trimmed.to_string());
                }
                continue;
            }
            match current.take() {
                Some((true, _, set)) => effective = Some(set),
                Some((false, _, set)) => plain = Some(set),
                None => {}
            }
        }

        match trimmed {
            "Effective restrictions:" => current = Some((true, indent, BTreeSet::new())),
            "Restrictions:" => current = Some((false, indent, BTreeSet::new())),
            _ => {}
        }
    }
    match current {
        Some((true, _, set)) => effective = Some(set),
        Some((false, _, set)) => plain = Some(set),
        None => {}
    }

    effective.or(plain).unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{cmd_output, mock_adb, MockAdb};
    use rstest::*;

    const USER_LIST: &str = "\
users:
  0: id=0, name=Owner, type=full.SYSTEM, flags=ADMIN|FULL|INITIALIZED|PRIMARY|SYSTEM (running) (current)
  1: id=10, name=Work profile, type=profile.MANAGED, flags=INITIALIZED|MANAGED_PROFILE|PROFILE, parentId=0 (running)
  2: id=11, name=Extra, type=full.SECONDARY, flags=INITIALIZED
";

    const DUMPSYS_USER: &str = "\
Users:
  UserInfo{0:Owner:c13} running
    Type: android.os.usertype.full.SYSTEM
    Restrictions:
      no_sms
    Device policy global restrictions:
      null
    Device policy local restrictions:
      null
    Effective restrictions:
      no_sms
      no_add_user
  UserInfo{10:Work profile:1030} running
    Type: android.os.usertype.profile.MANAGED
    Restrictions:
      none
    Effective restrictions:
      no_bluetooth
";

    fn device(adb: MockAdb) -> AdbDevice {
        AdbDevice::new(Box::new(adb), &RetryConfig::default())
    }

    #[test]
    fn test_parse_users() {
        let users = parse_users(USER_LIST);
        assert_eq!(users.len(), 3);
        assert_eq!(users[0].name, "Owner");
        assert!(users[0].is_system());
        assert_eq!(users[1].id, 10);
        assert_eq!(users[1].parent, Some(0));
        assert!(users[1].is_managed_profile());
        assert_eq!(users[2].parent, None);
        assert!(!users[2].is_managed_profile());
    }

    #[test]
    fn test_parse_owners() {
        let out = "2 owners:\nUser 0: admin=com.example.dpc/.Receiver,DeviceOwner,Affiliated\nUser 10: admin=com.example.po/com.example.po.Admin,ProfileOwner\n";
        let owners = parse_owners(out);
        assert_eq!(
            owners,
            vec![
                Owner {
                    component: "com.example.dpc/.Receiver".into(),
                    user: 0,
                    kind: OwnerKind::DeviceOwner,
                },
                Owner {
                    component: "com.example.po/com.example.po.Admin".into(),
                    user: 10,
                    kind: OwnerKind::ProfileOwner,
                },
            ]
        );
        assert!(parse_owners("no owners\n").is_empty());
    }

    #[test]
    fn test_parse_user_restrictions() {
        let sys = parse_user_restrictions(DUMPSYS_USER, 0);
        assert_eq!(
            sys.into_iter().collect::<Vec<_>>(),
            vec!["no_add_user", "no_sms"]
        );
        let work = parse_user_restrictions(DUMPSYS_USER, 10);
        assert_eq!(work.into_iter().collect::<Vec<_>>(), vec!["no_bluetooth"]);
        assert!(parse_user_restrictions(DUMPSYS_USER, 11).is_empty());
    }

    #[rstest]
    fn test_create_profile(mut mock_adb: MockAdb) {
        mock_adb
            .expect_shell()
            .withf(|cmd: &str| cmd == "pm create-user --profileOf 0 --managed 'Work profile'")
            .times(1)
            .returning(|_| Ok(cmd_output(0, "Success: created user id 12\n", "")));
        let dev = device(mock_adb);
        assert_eq!(dev.create_user("Work profile", Some(0)).unwrap(), 12);
    }

    #[rstest]
    fn test_failure_with_zero_status(mut mock_adb: MockAdb) {
        mock_adb
            .expect_shell()
            .returning(|_| Ok(cmd_output(0, "Error: couldn't create User.\n", "")));
        let dev = device(mock_adb);
        assert!(matches!(
            dev.create_user("Extra", None),
            Err(crate::Error::FatalProvisioning { .. })
        ));
    }

    #[rstest]
    fn test_transient_marker(mut mock_adb: MockAdb) {
        mock_adb.expect_shell().returning(|_| {
            Ok(cmd_output(
                255,
                "",
                "java.lang.IllegalStateException: android.os.DeadObjectException",
            ))
        });
        let dev = device(mock_adb);
        let err = dev
            .set_device_owner("com.example.dpc/.Receiver", 0)
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[rstest]
    fn test_is_installed_exact(mut mock_adb: MockAdb) {
        mock_adb
            .expect_shell()
            .withf(|cmd: &str| cmd == "pm list packages --user 0 'com.example.app'")
            .returning(|_| Ok(cmd_output(0, "package:com.example.app.extra\n", "")));
        let dev = device(mock_adb);
        assert!(!dev.is_installed("com.example.app", 0).unwrap());
    }

    #[rstest]
    fn test_global_setting(mut mock_adb: MockAdb) {
        mock_adb
            .expect_shell()
            .withf(|cmd: &str| cmd == "settings get global 'adb_enabled'")
            .returning(|_| Ok(cmd_output(0, "1\n", "")));
        mock_adb
            .expect_shell()
            .withf(|cmd: &str| cmd == "settings get global 'missing'")
            .returning(|_| Ok(cmd_output(0, "null\n", "")));
        let dev = device(mock_adb);
        assert_eq!(dev.global_setting("adb_enabled").unwrap().as_deref(), Some("1"));
        assert_eq!(dev.global_setting("missing").unwrap(), None);
    }

    #[rstest]
    fn test_install_failure_output(mut mock_adb: MockAdb) {
        mock_adb
            .expect_install()
            .withf(|apk: &str, user: &Option<UserId>| apk == "/tmp/app.apk" && *user == Some(10))
            .returning(|_, _| {
                Ok(cmd_output(
                    0,
                    "Performing Streamed Install\nFailure [INSTALL_FAILED_TEST_ONLY]\n",
                    "",
                ))
            });
        let dev = device(mock_adb);
        assert!(matches!(
            dev.install(Path::new("/tmp/app.apk"), 10),
            Err(crate::Error::FatalProvisioning { .. })
        ));
    }

    #[rstest]
    fn test_delegation_broadcast(mut mock_adb: MockAdb) {
        mock_adb
            .expect_shell()
            .withf(|cmd: &str| {
                cmd.contains("-n 'com.example.dpc/.Receiver'")
                    && cmd.ends_with("--esa scopes 'cert-install,app-restrictions'")
            })
            .returning(|_| {
                Ok(cmd_output(
                    0,
                    "Broadcasting: Intent { }\nBroadcast completed: result=-1\n",
                    "",
                ))
            });
        let dev = device(mock_adb);
        dev.set_delegated_scopes(
            "com.example.dpc/.Receiver",
            "com.example.app",
            0,
            &["cert-install".into(), "app-restrictions".into()],
        )
        .unwrap();
    }

    #[rstest]
    fn test_query_output_mentioning_exceptions(mut mock_adb: MockAdb) {
        let dump = format!(
            "{}  Last crash: java.lang.SecurityException: Failure in binder\n",
            DUMPSYS_USER
        );
        mock_adb
            .expect_shell()
            .withf(|cmd: &str| cmd == "dumpsys user")
            .returning(move |_| Ok(cmd_output(0, &dump, "")));
        let dev = device(mock_adb);
        assert!(dev.user_restriction("no_sms", 0).unwrap());
    }

    #[rstest]
    fn test_query_exit_status_still_checked(mut mock_adb: MockAdb) {
        mock_adb
            .expect_shell()
            .withf(|cmd: &str| cmd == "cmd user list -v")
            .returning(|_| Ok(cmd_output(1, "", "cmd: Can't find service: user")));
        let dev = device(mock_adb);
        assert!(matches!(
            dev.users(),
            Err(crate::Error::FatalProvisioning { .. })
        ));
    }

    #[rstest]
    fn test_secure_setting_commands(mut mock_adb: MockAdb) {
        mock_adb
            .expect_shell()
            .withf(|cmd: &str| cmd == "settings --user 10 get secure 'location_mode'")
            .returning(|_| Ok(cmd_output(0, "null\n", "")));
        mock_adb
            .expect_shell()
            .withf(|cmd: &str| cmd == "settings --user 10 put secure 'location_mode' '3'")
            .times(1)
            .returning(|_| Ok(cmd_output(0, "", "")));
        mock_adb
            .expect_shell()
            .withf(|cmd: &str| cmd == "settings --user 10 delete secure 'location_mode'")
            .times(1)
            .returning(|_| Ok(cmd_output(0, "Deleted 1 rows\n", "")));
        let dev = device(mock_adb);
        assert_eq!(dev.secure_setting("location_mode", 10).unwrap(), None);
        dev.put_secure_setting("location_mode", 10, "3").unwrap();
        dev.delete_secure_setting("location_mode", 10).unwrap();
    }

    #[rstest]
    #[case("Broadcast completed: result=-1, data=\"cert-install,app-restrictions\"\n", vec!["cert-install", "app-restrictions"])]
    #[case("Broadcast completed: result=-1, data=\"\"\n", vec![])]
    #[case("Broadcast completed: result=-1\n", vec![])]
    fn test_delegated_scopes(
        mut mock_adb: MockAdb,
        #[case] output: &'static str,
        #[case] expected: Vec<&str>,
    ) {
        mock_adb
            .expect_shell()
            .withf(|cmd: &str| {
                cmd.contains(GET_DELEGATED_SCOPES_ACTION) && cmd.ends_with("--es package 'com.example.app'")
            })
            .returning(move |_| Ok(cmd_output(0, output, "")));
        let dev = device(mock_adb);
        assert_eq!(
            dev.delegated_scopes("com.example.dpc/.Receiver", "com.example.app", 0)
                .unwrap(),
            expected
        );
    }

    #[cfg(unix)]
    #[rstest]
    fn test_install_non_utf8_path(mut mock_adb: MockAdb) {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        mock_adb.expect_install().never();
        let dev = device(mock_adb);
        let apk = Path::new(OsStr::from_bytes(b"/tmp/\xffapp.apk"));
        assert!(matches!(
            dev.install(apk, 0),
            Err(crate::Error::InvalidPath(_))
        ));
    }

    #[rstest]
    fn test_delegation_rejected(mut mock_adb: MockAdb) {
        mock_adb
            .expect_shell()
            .returning(|_| Ok(cmd_output(0, "Broadcast completed: result=0\n", "")));
        let dev = device(mock_adb);
        assert!(dev
            .set_delegated_scopes("com.example.dpc/.Receiver", "com.example.app", 0, &[])
            .is_err());
    }
}
