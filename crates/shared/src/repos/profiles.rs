use sqlx::Row;
use sqlx::postgres::PgRow;

use crate::models::UserProfile;

use super::{ProfileStore, Store, StoreError, StoreFuture};

impl Store {
    pub async fn load_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, display_name, created_at, updated_at
             FROM user_profiles
             WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(profile_from_row).transpose()
    }

    pub async fn upsert_profile(
        &self,
        user_id: &str,
        display_name: Option<&str>,
    ) -> Result<UserProfile, StoreError> {
        let row = sqlx::query(
            "INSERT INTO user_profiles (user_id, display_name)
             VALUES ($1, $2)
             ON CONFLICT (user_id) DO UPDATE
             SET display_name = EXCLUDED.display_name,
                 updated_at = NOW()
             RETURNING user_id, display_name, created_at, updated_at",
        )
        .bind(user_id)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;

        profile_from_row(&row)
    }
}

impl ProfileStore for Store {
    fn get_profile<'a>(&'a self, user_id: &'a str) -> StoreFuture<'a, Option<UserProfile>> {
        Box::pin(self.load_profile(user_id))
    }

    fn save_profile<'a>(
        &'a self,
        user_id: &'a str,
        display_name: Option<&'a str>,
    ) -> StoreFuture<'a, UserProfile> {
        Box::pin(self.upsert_profile(user_id, display_name))
    }
}

fn profile_from_row(row: &PgRow) -> Result<UserProfile, StoreError> {
    Ok(UserProfile {
        user_id: row.try_get("user_id")?,
        display_name: row.try_get("display_name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
