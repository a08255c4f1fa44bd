//! Test helpers for boot scenarios

#![allow(dead_code)]

use boot_engine::{BootConfig, BootEngine};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// A temporary services directory plus a scratch area for marker files
pub struct ServiceDir {
    dir: TempDir,
}

impl ServiceDir {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("services")).unwrap();
        Self { dir }
    }

    pub fn services(&self) -> PathBuf {
        self.dir.path().join("services")
    }

    /// Path for a marker file a service may create
    pub fn marker(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write a service description file
    pub fn service(&self, id: &str, content: &str) -> &Self {
        std::fs::write(self.services().join(id), content).unwrap();
        self
    }

    /// Write a scripted service that touches `<id>.done` and depends on `deps`
    pub fn touching(&self, id: &str, deps: &[&str]) -> &Self {
        let mut content = format!(
            "type = scripted\ncommand = touch {}\n",
            self.marker(&format!("{}.done", id)).display()
        );
        for dep in deps {
            content.push_str(&format!("depends-on = {}\n", dep));
        }
        self.service(id, &content)
    }

    pub fn ran(&self, id: &str) -> bool {
        self.marker(&format!("{}.done", id)).exists()
    }

    pub fn engine(&self) -> BootEngine {
        BootEngine::from_dir(self.services(), fast_config()).unwrap()
    }
}

/// Engine configuration with a short grace interval
pub fn fast_config() -> BootConfig {
    BootConfig {
        grace_interval: Duration::from_millis(100),
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}
