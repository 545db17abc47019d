//! Request decoding and dispatch.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use inbd_core::CommandRunner;

use crate::disk::DiskProbe;
use crate::pipeline::Orchestrator;
use crate::request::{HashAlgorithm, PowerState, UpdateRequest, UpdateResponse};

/// One request line on the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    UpdateSystemSoftware(UpdateRequest),
    SetPowerState {
        state: PowerState,
    },
    LoadConfig {
        uri: String,
        #[serde(default)]
        signature: String,
        #[serde(default)]
        hash_algorithm: HashAlgorithm,
    },
    GetConfig {
        path: String,
    },
    SetConfig {
        path: String,
    },
    AppendConfig {
        path: String,
    },
    RemoveConfig {
        path: String,
    },
}

impl Command {
    const fn name(&self) -> &'static str {
        match self {
            Self::UpdateSystemSoftware(_) => "UpdateSystemSoftware",
            Self::SetPowerState { .. } => "SetPowerState",
            Self::LoadConfig { .. } => "LoadConfig",
            Self::GetConfig { .. } => "GetConfig",
            Self::SetConfig { .. } => "SetConfig",
            Self::AppendConfig { .. } => "AppendConfig",
            Self::RemoveConfig { .. } => "RemoveConfig",
        }
    }
}

/// Decode one line and run it. Undecodable input is a 400.
pub async fn handle_line<R: CommandRunner, P: DiskProbe>(
    orchestrator: &Orchestrator<R, P>,
    line: &str,
) -> UpdateResponse {
    match serde_json::from_str::<Command>(line) {
        Ok(command) => dispatch(orchestrator, command).await,
        Err(e) => {
            debug!(error = %e, "undecodable request");
            UpdateResponse::bad_request(format!("invalid request: {e}"))
        }
    }
}

pub async fn dispatch<R: CommandRunner, P: DiskProbe>(
    orchestrator: &Orchestrator<R, P>,
    command: Command,
) -> UpdateResponse {
    let name = command.name();
    info!(command = name, "request received");
    let response = match command {
        Command::UpdateSystemSoftware(request) => {
            orchestrator.update_system_software(request).await
        }
        Command::SetPowerState { state } => orchestrator.set_power_state(state).await,
        Command::LoadConfig {
            uri,
            signature,
            hash_algorithm,
        } => {
            orchestrator
                .load_config(&uri, &signature, hash_algorithm)
                .await
        }
        Command::GetConfig { path } => orchestrator.get_config(&path).await,
        Command::SetConfig { path } => orchestrator.set_config(&path).await,
        Command::AppendConfig { path } => orchestrator.append_config(&path).await,
        Command::RemoveConfig { path } => orchestrator.remove_config(&path).await,
    };
    info!(command = name, status = response.status_code, "request finished");
    response
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::request::UpdateMode;

    #[test]
    fn decodes_tagged_commands() {
        let cmd: Command = serde_json::from_str(
            r#"{"command":"UpdateSystemSoftware","mode":"NO_DOWNLOAD","package_list":["emacs"]}"#,
        )
        .unwrap();
        let Command::UpdateSystemSoftware(req) = cmd else {
            panic!("wrong variant");
        };
        assert_eq!(req.mode, UpdateMode::NoDownload);
        assert_eq!(req.package_list, vec!["emacs".to_string()]);

        let cmd: Command =
            serde_json::from_str(r#"{"command":"SetPowerState","state":"OFF"}"#).unwrap();
        assert_eq!(cmd, Command::SetPowerState { state: PowerState::Off });

        let cmd: Command = serde_json::from_str(
            r#"{"command":"LoadConfig","uri":"https://repo.example.com/c.json"}"#,
        )
        .unwrap();
        assert!(matches!(
            cmd,
            Command::LoadConfig { hash_algorithm: HashAlgorithm::Sha384, ref signature, .. }
                if signature.is_empty()
        ));
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"command":"Format"}"#).is_err());
    }
}
