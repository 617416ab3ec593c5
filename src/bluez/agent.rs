//! `NoInputNoOutput` "just works" pairing agent (spec §4.4).
//!
//! Every authorization request is approved automatically. Registration
//! failure is fatal at startup; unregistering on drop matches the teacher's
//! general "hold the handle for the process lifetime" idiom for long-lived
//! bus registrations (its MPRIS-adjacent volume monitor and IPC server both
//! run for the whole process, torn down only at shutdown).

use bluer::agent::{Agent, AgentHandle, ReqResult};
use log::info;

use crate::error::CoreError;

pub struct PairingAgent {
    // Kept alive for the process lifetime; BlueZ unregisters the agent when
    // this handle is dropped.
    _handle: AgentHandle,
}

impl PairingAgent {
    pub async fn register(session: &bluer::Session) -> Result<Self, CoreError> {
        let agent = Agent {
            request_default: true,
            request_confirmation: Some(Box::new(|req| {
                Box::pin(async move {
                    info!("auto-confirming pairing for {} (passkey {})", req.device, req.passkey);
                    ReqResult::Ok(())
                })
            })),
            request_authorization: Some(Box::new(|req| {
                Box::pin(async move {
                    info!("auto-authorizing pairing for {}", req.device);
                    ReqResult::Ok(())
                })
            })),
            authorize_service: Some(Box::new(|req| {
                Box::pin(async move {
                    info!("auto-authorizing service {} for {}", req.service, req.device);
                    ReqResult::Ok(())
                })
            })),
            ..Default::default()
        };
        let handle = session
            .register_agent(agent)
            .await
            .map_err(|e| CoreError::DbusUnavailable(e.to_string()))?;
        Ok(Self { _handle: handle })
    }
}
