use std::io;
use std::process::{Child, ExitStatus};

use mockall::mock;
use rstest::fixture;

use crate::command::CmdOutput;
use crate::precondition::UserId;

mock! {
    pub Adb {

    }

    impl crate::adb::Adb for Adb {
        fn get_connected_devices(&self) -> crate::Result<Vec<String>>;
        fn install(&self, apk: &str, user: Option<UserId>) -> crate::Result<CmdOutput>;
        fn shell(&self, shell_cmd: &str) -> crate::Result<CmdOutput>;
        fn spawn_shell(&self, shell_cmd: &str) -> io::Result<Child>;
    }
}

#[fixture]
pub fn mock_adb() -> MockAdb {
    MockAdb::new()
}

/// Build the output of a finished command
#[cfg(unix)]
pub fn cmd_output(code: i32, stdout: &str, stderr: &str) -> CmdOutput {
    use std::os::unix::process::ExitStatusExt;

    CmdOutput {
        status: ExitStatus::from_raw(code << 8),
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
    }
}
