//! Offline recovery.

use dblayer_core::DbMode;
use tracing::info;

use super::Settings;

/// Opens the environment once so that a crashed run is recovered, then
/// closes it cleanly.
pub fn run(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let layer = settings.layer()?;
    let mode = DbMode::NORMAL | DbMode::NO_DBTHREADS;
    let result = layer.start(mode).and_then(|()| {
        let recovered = layer.recovery_required();
        layer.close(mode).map(|()| recovered)
    });
    layer.terminate();
    if result? {
        info!("Database recovered");
        println!("✓ Recovery ran; the environment is consistent");
    } else {
        println!("✓ Previous shutdown was clean; nothing to recover");
    }
    Ok(())
}
