use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Preference Models
// ============================================================================

/// Namespace holding the location sharing preferences.
pub const LOCATION_SHARING_PREFS: &str = "location_sharing_prefs";

/// Key of "my generated key" inside [`LOCATION_SHARING_PREFS`].
pub const GENERATED_KEY: &str = "generated_key";

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Preference {
    pub namespace: String,
    pub key: String,
    pub value: String,
    pub updated_at: NaiveDateTime,
}
