//! Offline backup and restore.

use std::path::Path;

use dblayer_core::RestoreOptions;
use tracing::info;

use super::Settings;

/// Archives the database into `dest` with the server stopped.
pub fn db2bak(settings: &Settings, dest: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let layer = settings.layer()?;
    info!("Backing up {} to {}", layer.config().directory.display(), dest.display());
    let result = layer.db2archive(dest, true);
    layer.terminate();
    let report = result?;

    println!("✓ Backup created successfully");
    println!("  Path: {}", dest.display());
    println!("  Files: {}", report.files);
    println!("  Logs: {}", report.logs.len());
    if report.attempts > 1 {
        println!("  Attempts: {}", report.attempts);
    }
    Ok(())
}

/// Restores the archive in `src`, optionally only `instance`, with the
/// server stopped.
pub fn bak2db(
    settings: &Settings,
    src: &Path,
    instance: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let layer = settings.layer()?;
    if let Some(name) = instance {
        if layer.instance(name).is_err() {
            layer.add_instance(name)?;
        }
    }
    let mut options = RestoreOptions::new().offline(true);
    if let Some(name) = instance {
        options = options.with_instance(name);
    }
    info!("Restoring {} from {}", layer.config().directory.display(), src.display());
    let result = layer.archive2db(src, &options);
    layer.terminate();
    let report = result?;

    println!("✓ Restore completed successfully");
    println!("  Files: {}", report.files);
    println!(
        "  Recovery: {}",
        if report.logs_restored { "catastrophic, from the restored logs" } else { "none" }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dblayer_core::{DbLayer, DbMode};
    use std::fs;
    use tempfile::tempdir;

    fn seed(dir: &Path) {
        let layer = DbLayer::init(dblayer_core::DbLayerConfig::new(dir)).unwrap();
        layer.start(DbMode::NORMAL | DbMode::NO_DBTHREADS).unwrap();
        let instance = layer.add_instance("userRoot").unwrap();
        {
            let db = layer.get_primary(&instance).unwrap();
            db.put(None, b"1", b"dc=example,dc=com").unwrap();
        }
        layer.close(DbMode::NORMAL | DbMode::NO_DBTHREADS).unwrap();
        layer.terminate();
    }

    #[test]
    fn offline_backup_and_restore() {
        let root = tempdir().unwrap();
        let db = root.path().join("db");
        let bak = root.path().join("bak");
        seed(&db);
        let settings = Settings {
            dir: Some(db.clone()),
            config: None,
        };

        db2bak(&settings, &bak).unwrap();
        assert!(bak.join("userRoot").join("id2entry.db").is_file());
        assert!(bak.join("DBVERSION").is_file());

        fs::remove_dir_all(db.join("userRoot")).unwrap();
        fs::create_dir_all(db.join("userRoot")).unwrap();
        fs::write(db.join("userRoot").join("id2entry.db"), b"").unwrap();
        bak2db(&settings, &bak, None).unwrap();
        assert!(fs::metadata(db.join("userRoot").join("id2entry.db")).unwrap().len() > 0);
    }
}
