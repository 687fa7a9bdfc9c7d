// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Mutex<SessionRegistry>>,
}
