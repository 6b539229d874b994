use std::io;
use std::process::Child;

use mockall::mock;
use rstest::fixture;

use harrier::command::CmdOutput;
use harrier::precondition::UserId;

#[fixture]
pub fn mock_adb() -> MockAdb {
    MockAdb::new()
}

mock! {
    pub Adb {

    }

    impl harrier::adb::Adb for Adb {
        fn get_connected_devices(&self) -> harrier::Result<Vec<String>>;
        fn install(&self, apk: &str, user: Option<UserId>) -> harrier::Result<CmdOutput>;
        fn shell(&self, shell_cmd: &str) -> harrier::Result<CmdOutput>;
        fn spawn_shell(&self, shell_cmd: &str) -> io::Result<Child>;
    }
}

/// Build the output of a finished command
#[cfg(unix)]
pub fn cmd_output(code: i32, stdout: &str) -> CmdOutput {
    use std::os::unix::process::ExitStatusExt;

    CmdOutput {
        status: std::process::ExitStatus::from_raw(code << 8),
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}
