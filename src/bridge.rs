//! The event bridge: one phase invocation is one nested RPC conversation.
//!
//! `HandleEvent` opens the conversation; every response either ends it
//! (`Data == "ret"`) or names a PDK method for the host to run, whose
//! outcome is sent back as a `Step` (success) or `StepError` (failure)
//! continuation. The server's `EventId` threads the exchanges together;
//! concurrent conversations interleave freely on the shared client.

use rmpv::Value;
use tracing::debug;

use crate::error::HostError;
use crate::gateway::Pdk;
use crate::phase::Phase;
use crate::rpc::{message, RpcClient};

pub async fn handle_event(
    rpc: &RpcClient,
    pdk: &dyn Pdk,
    instance_id: &str,
    phase: Phase,
) -> Result<(), HostError> {
    let phase_name: &str = phase.as_ref();
    let mut response = rpc
        .call(
            "plugin.HandleEvent",
            vec![message::map(vec![
                ("InstanceId", Value::from(instance_id)),
                ("EventName", Value::from(phase_name)),
            ])],
        )
        .await?;

    loop {
        let event_id = message::field(&response, "EventId")
            .cloned()
            .unwrap_or(Value::Nil);
        let data = message::field(&response, "Data")
            .cloned()
            .unwrap_or(Value::Nil);

        if data.as_str() == Some("ret") {
            return Ok(());
        }

        let method = message::field(&data, "Method")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| HostError::Protocol(format!("event step without a Method: {data}")))?;
        let args = message::field(&data, "Args").cloned().unwrap_or(Value::Nil);

        let (continuation, payload) = match pdk.call_pdk_method(&method, args).await {
            Ok(result) => ("plugin.Step", result),
            Err(e) => {
                debug!(method = %method, error = %e, "pdk method failed; forwarding to plugin");
                ("plugin.StepError", Value::from(e.to_string()))
            }
        };

        response = rpc
            .call(
                continuation,
                vec![message::map(vec![
                    ("EventId", event_id),
                    ("Data", payload),
                ])],
            )
            .await?;
    }
}
