use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use rstest::fixture;

/// A scratch directory, removed with everything in it when dropped
pub struct TmpDir {
    path: PathBuf,
}

impl TmpDir {
    pub fn new() -> Self {
        let name: u64 = rand::thread_rng().gen();
        let path = env::temp_dir().join(format!("harrier_tmp_{}", name));
        fs::create_dir_all(&path).expect("failed to make temp directory");
        Self { path }
    }

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    /// Write `content` to `name`, creating any missing parent directories
    pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.path.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create parent directories");
        }
        fs::write(&path, content).expect("failed to write temp file");
        path
    }
}

impl Drop for TmpDir {
    fn drop(&mut self) {
        _ = fs::remove_dir_all(&self.path);
    }
}

#[fixture]
pub fn tmp_dir() -> TmpDir {
    TmpDir::new()
}
