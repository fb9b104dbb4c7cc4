//! Commands for reading and editing client settings.

use super::{AppContext, CommandError};
use crate::settings::ClientSettings;

pub fn get_settings(ctx: &AppContext) -> ClientSettings {
    ctx.settings.get()
}

pub fn get_server_url(ctx: &AppContext) -> String {
    ctx.settings.server_url()
}

/// Persist a new server URL.
///
/// The status channel keeps its current socket and picks the new URL up on
/// its next connection attempt. HTTP calls use it right away.
pub fn set_server_url(ctx: &AppContext, url: &str) -> Result<String, CommandError> {
    let url = ctx.settings.set_server_url(url)?;
    ctx.store.note(&format!(
        "Server URL set to {} (status channel switches on next reconnect)",
        url
    ));
    Ok(url)
}
