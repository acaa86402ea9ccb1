//! Entitlement writes. Only called from inside a settlement transaction.

use crate::database::error::DatabaseError;
use crate::database::repository::EntitlementGrant;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

/// Records the grant in the ledger and applies its effect.
///
/// The ledger insert is keyed by payment id; if a row already exists the
/// effect is skipped.
pub async fn apply_grant(
    tx: &mut Transaction<'_, Postgres>,
    payment_id: Uuid,
    grant: &EntitlementGrant,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let inserted = sqlx::query(
        "INSERT INTO entitlement_grants (payment_id, user_id, product_type, granted_at) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (payment_id) DO NOTHING",
    )
    .bind(payment_id)
    .bind(grant.user_id())
    .bind(grant.product_type().as_str())
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(DatabaseError::from_sqlx)?
    .rows_affected();

    if inserted == 0 {
        warn!(payment_id = %payment_id, "entitlement already granted for payment");
        return Ok(());
    }

    match grant {
        EntitlementGrant::Subscription { user_id, days } => {
            sqlx::query(
                "INSERT INTO subscriptions (user_id, expires_at) \
                 VALUES ($1, $2 + make_interval(days => $3)) \
                 ON CONFLICT (user_id) DO UPDATE \
                 SET expires_at = GREATEST(subscriptions.expires_at, $2) + make_interval(days => $3)",
            )
            .bind(user_id)
            .bind(now)
            .bind(days)
            .execute(&mut **tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        }
        EntitlementGrant::ProfileUnlock {
            user_id,
            target_profile_id,
        } => {
            sqlx::query(
                "INSERT INTO profile_unlocks (user_id, target_profile_id, payment_id, unlocked_at) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (user_id, target_profile_id) DO NOTHING",
            )
            .bind(user_id)
            .bind(target_profile_id)
            .bind(payment_id)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        }
        EntitlementGrant::DailyUnlock {
            user_id,
            credits,
            valid_until,
        } => {
            sqlx::query(
                "INSERT INTO unlock_credits (payment_id, user_id, credits, expires_at) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(payment_id)
            .bind(user_id)
            .bind(credits)
            .bind(valid_until)
            .execute(&mut **tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        }
    }

    info!(
        payment_id = %payment_id,
        user_id = %grant.user_id(),
        product_type = %grant.product_type(),
        "entitlement granted"
    );
    Ok(())
}
