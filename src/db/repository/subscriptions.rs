//! Subscription → plan → credential/package resolution
//!
//! Plans and subscriptions are owned by the billing collaborator; this
//! module only reads them.

use sqlx::PgPool;

use crate::db::models::{ChannelRow, CredentialRow};

/// Credentials assigned to the user's active plans, by assignment priority
pub async fn plan_credentials_for_user(
    pool: &PgPool,
    user_id: i64,
) -> Result<Vec<CredentialRow>, sqlx::Error> {
    sqlx::query_as::<_, CredentialRow>(
        r#"
        SELECT c.id, c.provider_id, c.server_url, c.username, c.password,
               c.max_connections, c.is_active, c.health_status
        FROM user_subscriptions us
        JOIN subscription_plans sp ON sp.id = us.plan_id AND sp.is_active = TRUE
        JOIN plan_credentials pc ON pc.plan_id = sp.id
        JOIN credentials c ON c.id = pc.credential_id AND c.is_active = TRUE
        WHERE us.user_id = $1
          AND us.status = 'active'
          AND (us.current_period_end IS NULL OR us.current_period_end > NOW())
        GROUP BY c.id
        ORDER BY MIN(pc.priority), c.id
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

/// Enabled channels of active packages on the user's active plans, in
/// subscription → plan → package join order
pub async fn package_channels_for_user(
    pool: &PgPool,
    user_id: i64,
) -> Result<Vec<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(
        r#"
        SELECT ch.id, ch.provider_id, ch.stream_id, ch.name, ch.logo, ch.category_id,
               ch.category_name, ch.epg_channel_id, ch.is_enabled
        FROM user_subscriptions us
        JOIN subscription_plans sp ON sp.id = us.plan_id AND sp.is_active = TRUE
        JOIN plan_packages pp ON pp.plan_id = sp.id
        JOIN channel_packages pkg ON pkg.id = pp.package_id AND pkg.is_active = TRUE
        JOIN package_channels pkc ON pkc.package_id = pkg.id
        JOIN channels ch ON ch.id = pkc.channel_id AND ch.is_enabled = TRUE
        WHERE us.user_id = $1
          AND us.status = 'active'
          AND (us.current_period_end IS NULL OR us.current_period_end > NOW())
        ORDER BY us.id, pp.id, pkc.sort_order, pkc.id
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}
