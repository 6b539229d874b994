use blanket::blanket;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use directories::BaseDirs;
use which::{which, which_in};

use crate::config::Config;
use crate::utils::ensure_dir_exists;
use crate::Error;

use std::sync::{Mutex, PoisonError};

pub const PROJECT_HOME_ENV: &str = "HARRIER_PROJECT_HOME";
pub const PATH_ENV: &str = "HARRIER_PATH";
pub const SERIAL_ENV: &str = "ANDROID_SERIAL";

pub const CONFIG_FILE_NAME: &str = "harrier.toml";

fn wrapped_which(bin: &str) -> Option<PathBuf> {
    if let Ok(harrier_path) = env::var(PATH_ENV) {
        let cwd = env::current_dir().ok()?;
        return which_in(bin, Some(&harrier_path), &cwd).ok();
    }
    which(bin).ok()
}

#[inline(always)]
fn find_program(prog: &str) -> Option<String> {
    wrapped_which(prog).map(|it| it.to_string_lossy().into())
}

/// Context is a trait for an object that can help standardize file locations,
/// find binaries, and lookup env vars.
///
/// Most methods on this trait have a default implementation that is perfectly
/// safe to leave unchanged.
#[blanket(derive(Ref, Box))]
pub trait Context: Send + Sync {
    fn maybe_get_env(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn maybe_get_bin(&self, bin: &str) -> Option<String> {
        find_program(bin)
    }

    fn has_bin(&self, bin: &str) -> bool {
        self.maybe_get_bin(bin).is_some()
    }

    fn get_bin(&self, bin: &str) -> crate::Result<String> {
        self.maybe_get_bin(bin)
            .ok_or_else(|| Error::MissingBin(bin.into()))
    }

    fn has_env(&self, key: &str) -> bool {
        self.maybe_get_env(key).is_some()
    }

    fn get_env(&self, key: &str) -> crate::Result<String> {
        self.maybe_get_env(key)
            .ok_or_else(|| Error::MissingEnv(key.into()))
    }

    fn get_project_dir(&self) -> crate::Result<PathBuf> {
        let home = self
            .get_env(PROJECT_HOME_ENV)
            .map(|env| PathBuf::new().join(env))?;
        if !home.exists() {
            return Err(Error::InvalidEnv(
                PROJECT_HOME_ENV.into(),
                format!("{} doesn't exist", home.display()),
            ));
        }
        Ok(home)
    }

    fn get_project_config_file(&self) -> crate::Result<PathBuf> {
        self.get_project_dir_child(CONFIG_FILE_NAME)
    }

    fn get_project_config<'a>(&'a self) -> crate::Result<Option<&'a Config>>;

    fn get_project_dir_child(&self, child: &str) -> crate::Result<PathBuf> {
        self.get_project_dir().map(|x| x.join(child))
    }

    /// Directory run reports and logs are written to
    fn get_output_dir(&self) -> crate::Result<PathBuf> {
        let out = self.get_project_dir_child("harrier_out")?;
        ensure_dir_exists(&out)?;
        Ok(out)
    }

    fn get_user_config_dir(&self) -> crate::Result<PathBuf> {
        let bd = BaseDirs::new().ok_or(Error::NoBaseDirs)?;
        Ok(bd.config_dir().join("harrier"))
    }
}

pub struct DefaultContext {
    /// Binary name to resolved path
    bin_cache: Mutex<HashMap<String, String>>,
    project_config: OnceCell<Option<Config>>,
}

impl Clone for DefaultContext {
    fn clone(&self) -> Self {
        let cache = self.bin_cache.lock().unwrap_or_else(PoisonError::into_inner);
        Self {
            bin_cache: Mutex::new(cache.clone()),
            project_config: self.project_config.clone(),
        }
    }
}

impl DefaultContext {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for DefaultContext {
    fn default() -> Self {
        Self {
            bin_cache: Mutex::new(HashMap::new()),
            project_config: OnceCell::new(),
        }
    }
}

impl Context for DefaultContext {
    /// Looks for `harrier.toml` in the project directory first and then in
    /// the user's config directory. Having neither is not an error.
    fn get_project_config<'a>(&'a self) -> crate::Result<Option<&'a Config>> {
        let cfg = self
            .project_config
            .get_or_try_init(|| -> crate::Result<Option<Config>> {
                let mut candidates = Vec::with_capacity(2);
                if self.has_env(PROJECT_HOME_ENV) {
                    candidates.push(self.get_project_config_file()?);
                }
                if let Ok(dir) = self.get_user_config_dir() {
                    candidates.push(dir.join(CONFIG_FILE_NAME));
                }
                for path in candidates {
                    if path.exists() {
                        log::debug!("using config file {}", path.display());
                        return Ok(Some(Config::parse(&path)?));
                    }
                }
                Ok(None)
            })?;
        Ok(cfg.as_ref())
    }

    fn maybe_get_env(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn maybe_get_bin(&self, prog: &str) -> Option<String> {
        let mut cache = self.bin_cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(path) = cache.get(prog) {
            return Some(path.clone());
        }
        let found = find_program(prog)?;
        cache.insert(prog.into(), found.clone());
        Some(found)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{tmp_context, TestContext};
    use rstest::*;

    #[rstest]
    fn test_project_dir(mut tmp_context: TestContext) {
        let dir = tmp_context.get_project_dir().unwrap();
        assert_eq!(dir, tmp_context.get_base_dir());
        assert_eq!(
            tmp_context.get_project_config_file().unwrap(),
            dir.join(CONFIG_FILE_NAME)
        );

        tmp_context.set_env(PROJECT_HOME_ENV, "/definitely/not/here");
        assert!(matches!(
            tmp_context.get_project_dir(),
            Err(Error::InvalidEnv(_, _))
        ));
    }

    #[rstest]
    fn test_project_config(mut tmp_context: TestContext) {
        assert!(tmp_context.get_project_config().unwrap().is_none());
        tmp_context.set_config("[device]\nserial = \"abc\"\n");
        let cfg = tmp_context.get_project_config().unwrap().expect("config");
        let device = cfg.get_map().maybe_get_map_typecheck("device").unwrap();
        assert_eq!(
            device.and_then(|d| d.maybe_get_str_typecheck("serial").unwrap()),
            Some("abc")
        );
    }

    #[rstest]
    fn test_missing_bin(tmp_context: TestContext) {
        assert!(!tmp_context.has_bin("not-a-real-binary"));
        assert!(matches!(
            tmp_context.get_bin("not-a-real-binary"),
            Err(Error::MissingBin(_))
        ));
    }
}
