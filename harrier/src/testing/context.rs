use std::collections::HashMap;
use std::path::{Path, PathBuf};

use mockall::mock;
use rstest::fixture;

use super::TmpDir;
use crate::config::Config;
use crate::context::{CONFIG_FILE_NAME, PROJECT_HOME_ENV, SERIAL_ENV};
use crate::Context;

#[fixture]
pub fn tmp_context() -> TestContext {
    TestContext::default()
}

#[fixture]
pub fn mock_context() -> MockContext {
    MockContext::new()
}

/// A [Context] rooted in a scratch project directory with a fixed
/// environment
pub struct TestContext {
    project: TmpDir,
    env: HashMap<String, String>,
    config: Option<Config>,
}

impl TestContext {
    pub fn set_env<K: AsRef<str>, V: AsRef<str>>(&mut self, key: K, value: V) -> &mut Self {
        self.env.insert(key.as_ref().into(), value.as_ref().into());
        self
    }

    /// Write `content` as the project's `harrier.toml` and use it
    pub fn set_config(&mut self, content: &str) -> &mut Self {
        let path = self.project.write_file(CONFIG_FILE_NAME, content);
        self.config = Some(Config::parse(&path).expect("invalid test config"));
        self
    }

    pub fn get_base_dir(&self) -> &Path {
        self.project.get_path()
    }
}

impl Default for TestContext {
    fn default() -> Self {
        let project = TmpDir::new();
        let env = HashMap::from([
            (
                PROJECT_HOME_ENV.to_string(),
                project.get_path().to_string_lossy().into_owned(),
            ),
            (SERIAL_ENV.to_string(), "TESTSERIAL".to_string()),
        ]);
        Self {
            project,
            env,
            config: None,
        }
    }
}

impl Context for TestContext {
    fn maybe_get_env(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned()
    }

    fn maybe_get_bin(&self, _bin: &str) -> Option<String> {
        None
    }

    fn get_user_config_dir(&self) -> crate::Result<PathBuf> {
        Ok(self.get_base_dir().join("config"))
    }

    fn get_project_config<'a>(&'a self) -> crate::Result<Option<&'a Config>> {
        Ok(self.config.as_ref())
    }
}

mock! {
    pub Context {

    }

    impl crate::Context for Context {
        fn maybe_get_env(&self, key: &str) -> Option<String>;
        fn maybe_get_bin(&self, bin: &str) -> Option<String>;
        fn get_project_dir(&self) -> crate::Result<PathBuf>;
        fn get_project_config<'a>(&'a self) -> crate::Result<Option<&'a Config>>;
    }
}
