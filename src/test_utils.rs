use std::path::PathBuf;

/// An empty directory under the system temporary directory, unique to this
/// test process and `name`. Any leftovers from a previous run are removed.
pub(crate) fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("snowex-stack-{name}-{}", std::process::id()));
    if dir.exists() {
        std::fs::remove_dir_all(&dir).expect("Removing an old scratch directory should not fail");
    }
    std::fs::create_dir_all(&dir).expect("Creating a scratch directory should not fail");
    dir
}
