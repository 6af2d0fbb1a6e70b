//! 会话、登录失败记录与分类解锁凭据的定期清理。

use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthConfig, prune_expired_sessions};
use crate::config::SESSION_PRUNE_INTERVAL_SECS;
use crate::gate::CategoryGate;

pub fn spawn_background_tasks(auth: Arc<AuthConfig>, gate: Arc<CategoryGate>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SESSION_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            prune_expired_sessions(&auth).await;
            auth.limiter.prune().await;
            gate.prune().await;
        }
    });
}
