//! Reboot gate: decide whether a finished run reboots, and perform it.

use std::time::Duration;

use tracing::info;

use inbd_core::exec::{REBOOT, SHUTDOWN};
use inbd_core::{CommandRunner, ExecError, Invocation};

use crate::distro::OsFamily;
use crate::request::PowerState;

/// What a finished run changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebootPlan {
    pub do_not_reboot: bool,
    pub family: OsFamily,
    /// An image was activated or packages were upgraded.
    pub system_changed: bool,
    pub kernel_args_changed: bool,
}

impl RebootPlan {
    /// Rules, first match wins: the request veto, a package run that changed
    /// nothing, kernel arguments, then any system change.
    pub const fn decide(&self) -> bool {
        if self.do_not_reboot {
            return false;
        }
        if matches!(self.family, OsFamily::Package)
            && !self.system_changed
            && !self.kernel_args_changed
        {
            return false;
        }
        self.kernel_args_changed || self.system_changed
    }
}

fn invocation(state: PowerState) -> Invocation {
    match state {
        PowerState::Cycle => Invocation::new([REBOOT]),
        PowerState::Off => Invocation::new([SHUTDOWN, "now"]),
    }
}

/// Sleep `delay` so pending log writes land, then reboot or power off.
pub async fn trigger<R: CommandRunner>(
    runner: &R,
    state: PowerState,
    delay: Duration,
) -> Result<(), ExecError> {
    info!(?state, delay_ms = delay.as_millis(), "power state change scheduled");
    tokio::time::sleep(delay).await;
    runner
        .run(&invocation(state))
        .await?
        .check("power state change")?;
    Ok(())
}
