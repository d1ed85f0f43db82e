//! Post-call menu documents.
//!
//! Menus are 1-1 with campaigns and stored as one JSONB document.
//! Saving a menu must be followed by a TTS cache invalidation for the
//! campaign; the engine wrapper in [`crate::engine`] couples the two.

use sqlx::Row;

use crate::error::Result;
use crate::models::{CampaignId, PostCallMenu};

use super::Database;

impl Database {
    /// Load a campaign's menu, if one was ever saved
    pub async fn get_menu(&self, campaign_id: CampaignId) -> Result<Option<PostCallMenu>> {
        let row = sqlx::query("SELECT document FROM post_call_menus WHERE campaign_id = $1")
            .bind(campaign_id)
            .fetch_optional(self.pool())
            .await?;

        match row {
            Some(row) => {
                let document: serde_json::Value = row.try_get("document")?;
                let menu: PostCallMenu = serde_json::from_value(document)
                    .map_err(|e| crate::error::EngineError::invalid_input(format!(
                        "stored menu for campaign {} is malformed: {}",
                        campaign_id, e
                    )))?;
                Ok(Some(menu))
            }
            None => Ok(None),
        }
    }

    /// Upsert a campaign's menu document
    pub async fn save_menu(&self, menu: &PostCallMenu) -> Result<()> {
        let document = serde_json::to_value(menu)
            .map_err(|e| crate::error::EngineError::invalid_input(e.to_string()))?;
        sqlx::query(
            "INSERT INTO post_call_menus (campaign_id, active, document, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (campaign_id)
             DO UPDATE SET active = $2, document = $3, updated_at = now()",
        )
        .bind(menu.campaign_id)
        .bind(menu.active)
        .bind(document)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
