//! Periodic cleanup of sessions, clients and page-name registrations whose
//! expiration has passed.

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{delete_expired_client, ClientError};
use crate::model::parse_full_session_id;
use crate::session_handler::SessionHandler;
use crate::state::AppState;

pub fn spawn_sweeper(state: AppState) -> JoinHandle<()> {
    let mut interval = tokio::time::interval(state.config.sweep_interval());
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            if let Err(err) = run_once(&state).await {
                warn!(error = %err, "sweep failed");
            }
        }
    })
}

/// One sweep pass. Each expired entry is popped from its index before it is
/// cleaned up, so a failure leaves the remainder for the next pass.
pub async fn run_once(state: &AppState) -> Result<(), ClientError> {
    for full_id in state.store.get_expired_sessions().await? {
        if let Err(err) = expire_session(state, &full_id).await {
            warn!(session = %full_id, error = %err, "failed to expire session");
        }
    }

    for client_id in state.store.get_expired_clients().await? {
        debug!(client_id = %client_id, "client expired");
        if let Err(err) = delete_expired_client(&state.store, &client_id, false).await {
            warn!(client_id = %client_id, error = %err, "failed to delete expired client");
        }
    }

    for page_name in state.store.get_expired_page_name_registrations().await? {
        debug!(page = %page_name, "page name registration expired");
        state.store.remove_page_name_registration(&page_name).await?;
    }
    Ok(())
}

async fn expire_session(state: &AppState, full_id: &str) -> Result<(), ClientError> {
    let Some((page_id, session_id)) = parse_full_session_id(full_id) else {
        warn!(session = %full_id, "malformed expired session reference");
        return Ok(());
    };
    let Some(page) = state.store.get_page_by_id(page_id).await? else {
        return Ok(());
    };

    if let Some(session) = state.store.get_session(&page, &session_id).await? {
        SessionHandler::new(&state.store, session)
            .send_page_event("close", "")
            .await?;
    }
    state.store.delete_session(page_id, &session_id).await?;
    info!(page = %page.name, session_id = %session_id, "session expired");

    if state.store.get_page_sessions(page_id).await?.is_empty()
        && state.store.get_page_host_clients(page_id).await?.is_empty()
    {
        info!(page = %page.name, "deleting abandoned page");
        state.store.delete_page(page_id).await?;
    }
    Ok(())
}
