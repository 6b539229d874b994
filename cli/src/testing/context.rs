use std::path::PathBuf;

use mockall::mock;
use rstest::fixture;

use harrier::config::Config;

#[fixture]
pub fn mock_context() -> MockContext {
    MockContext::new()
}

mock! {
    pub Context {

    }

    impl harrier::Context for Context {
        fn maybe_get_env(&self, key: &str) -> Option<String>;
        fn maybe_get_bin(&self, bin: &str) -> Option<String>;
        fn get_project_dir(&self) -> harrier::Result<PathBuf>;
        fn get_project_config<'a>(&'a self) -> harrier::Result<Option<&'a Config>>;
    }
}
