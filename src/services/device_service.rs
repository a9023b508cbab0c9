use tracing::info;

use crate::{
    dto::{
        device::{PairRequest, StatusResponse, TrustedDeviceView},
        game::GameView,
    },
    error::ServiceError,
    services::message_bus::Diagnostics,
    state::{SharedState, identity::{DeviceIdentity, Role}},
};

/// Snapshot of the connection, the live game and recording for the status screen.
pub async fn status(state: &SharedState) -> Result<StatusResponse, ServiceError> {
    let node = state.node();
    let connection = node.connection_state();
    let now = state.clock().now();
    Ok(StatusResponse {
        device: node.identity().clone(),
        role: node.role(),
        peer: connection.connected_peer().cloned(),
        connection,
        game: node.game().map(|game| GameView::from_state(&game, now)),
        recording: node.recording(),
        diagnostics: node.diagnostics().await?,
    })
}

pub async fn diagnostics(state: &SharedState) -> Result<Diagnostics, ServiceError> {
    state.node().diagnostics().await
}

pub async fn enable(state: &SharedState) -> Result<(), ServiceError> {
    info!("connectivity enabled from the bridge");
    state.node().enable().await
}

pub async fn disable(state: &SharedState) -> Result<(), ServiceError> {
    info!("connectivity disabled from the bridge");
    state.node().disable().await
}

pub async fn trusted_devices(state: &SharedState) -> Result<Vec<TrustedDeviceView>, ServiceError> {
    Ok(state
        .node()
        .trusted_devices()
        .await?
        .into_iter()
        .map(TrustedDeviceView::from)
        .collect())
}

/// Trust a device exchanged out of band. Pairing ourselves is refused.
pub async fn pair(state: &SharedState, request: PairRequest) -> Result<(), ServiceError> {
    if request.id == state.node().identity().id {
        return Err(ServiceError::InvalidInput(
            "a device cannot pair with itself".into(),
        ));
    }
    let identity = DeviceIdentity::new(request.id, request.display_name);
    state.node().pair(identity, request.role).await
}

pub async fn unpair(state: &SharedState, id: &str) -> Result<TrustedDeviceView, ServiceError> {
    Ok(state.node().unpair(id).await?.into())
}

/// Switch the local role, returning the trusted devices that were dropped.
pub async fn switch_role(
    state: &SharedState,
    role: Role,
) -> Result<Vec<TrustedDeviceView>, ServiceError> {
    Ok(state
        .node()
        .switch_role(role)
        .await?
        .into_iter()
        .map(TrustedDeviceView::from)
        .collect())
}

pub async fn report_recording(state: &SharedState, is_recording: bool) -> Result<(), ServiceError> {
    state.node().report_recording(is_recording).await
}

pub async fn start_recording(state: &SharedState) -> Result<(), ServiceError> {
    state.node().start_recording().await
}

pub async fn stop_recording(state: &SharedState) -> Result<(), ServiceError> {
    state.node().stop_recording().await
}
