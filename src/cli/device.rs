//! hubsync device command implementations.

use crate::cli::{Context, DeviceCommands};
use crate::error::{Error, Result};
use crate::hub::DeviceRegistration;
use crate::output::{emit_success, HumanOutput};

pub(crate) async fn run(ctx: &Context, cmd: DeviceCommands) -> Result<()> {
    match cmd {
        DeviceCommands::Register { name } => {
            if !ctx.hub.is_configured() {
                return Err(Error::NotConfigured("hub.url and hub.token"));
            }
            let device_id = ctx.ensure_device_id()?;
            let name = name.unwrap_or_else(|| device_id.clone());
            let registration = DeviceRegistration::for_this_host(&device_id, name);
            let response = ctx.hub.register_device(&registration).await?.into_result()?;
            let human = HumanOutput::new(format!("Registered device {device_id}"));
            emit_success(ctx.output, "device register", &response, Some(&human))
        }
        DeviceCommands::Heartbeat => {
            let device_id = ctx.device_id()?;
            let response = ctx.hub.heartbeat(&device_id).await?.into_result()?;
            let human = HumanOutput::new(format!("Heartbeat sent for {device_id}"));
            emit_success(ctx.output, "device heartbeat", &response, Some(&human))
        }
    }
}
