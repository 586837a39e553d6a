//! `metachat start`: run the bridge until Ctrl-C or a fatal error.

use crate::backends::build_backends;
use metachat_channels::bridge::{Bridge, BridgeError};
use metachat_types::config::MetachatConfig;
use tracing::info;

pub async fn cmd_start(config: MetachatConfig) -> Result<(), BridgeError> {
    let addr = config.listen_addr()?;
    let backends = build_backends(&config)?;
    let mut bridge = Bridge::new(backends, &config.rooms, config.bridge.clone())?;

    let shutdown = bridge.shutdown_handle();
    let handle = bridge.handle();
    let server_shutdown = shutdown.clone();
    bridge.supervise("control-surface", async move {
        metachat_api::server::serve(addr, handle, async move { server_shutdown.wait().await })
            .await
            .map_err(BridgeError::Surface)
    });

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            ctrl_c.trigger();
        }
    });

    bridge.run().await
}
