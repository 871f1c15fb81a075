use scenevault::{Config, SceneVault};
use tempfile::TempDir;

/// A vault backed by a throwaway data directory. Keep the TempDir alive
/// for the duration of the test.
pub fn vault() -> (TempDir, SceneVault) {
    let temp = TempDir::new().unwrap();
    let vault = SceneVault::open(&Config::new(temp.path())).unwrap();
    (temp, vault)
}

/// Writes are timestamped at microsecond precision; calling this between
/// two writes keeps their order observable.
pub fn tick() {
    std::thread::sleep(std::time::Duration::from_millis(2));
}
