//! Image-update tool invocations for the A/B image family.

use std::path::Path;

use tracing::info;

use inbd_core::{CommandRunner, Invocation};

use crate::error::UpdateError;

/// Write the verified image at `file` to the inactive slot.
pub async fn write_inactive<R: CommandRunner>(
    runner: &R,
    tool: &str,
    file: &Path,
    signature: &str,
) -> Result<(), UpdateError> {
    let file = file.to_string_lossy();
    runner
        .run(&Invocation::new([tool, "-w", "-u", file.as_ref(), "-s", signature]))
        .await
        .and_then(|out| out.check("image write"))
        .map_err(UpdateError::ImageWrite)?;
    info!(file = %file, "image written to inactive slot");
    Ok(())
}

/// Make the inactive slot the boot target for the next boot.
pub async fn activate<R: CommandRunner>(runner: &R, tool: &str) -> Result<(), UpdateError> {
    runner
        .run(&Invocation::new([tool, "-a"]))
        .await
        .and_then(|out| out.check("image activate"))
        .map_err(UpdateError::ImageActivate)?;
    info!("inactive slot activated");
    Ok(())
}

/// Make the running slot permanent.
pub async fn commit<R: CommandRunner>(runner: &R, tool: &str) -> Result<(), UpdateError> {
    runner
        .run(&Invocation::new([tool, "-c"]))
        .await
        .and_then(|out| out.check("image commit"))
        .map_err(UpdateError::ImageCommit)?;
    info!("image slot committed");
    Ok(())
}
