// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::manager::SessionManager;
use crate::mux::MuxManager;

/// Shared gateway state.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub manager: Arc<SessionManager>,
    pub mux: Arc<MuxManager>,
    pub shutdown: CancellationToken,
}
