//! 后端参加者校验
//!
//! 订阅一个计划的通道前先问后端这名用户是否真的有资格共享位置。
//! 后端不可达和明确拒绝是两种错误：前者由会话当作临时故障呈现，
//! 后者直接终止连接流程。

use async_trait::async_trait;
use puctee_core::error::AccessError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::model::UserIdentity;
use crate::domain::repository::{AccessGrant, PlanAccessValidator};

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct ValidateRequest {
    plan_id: i64,
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    profile_image_url: Option<String>,
}

pub struct RestAccessValidator {
    client: Client,
    base_url: String,
}

impl RestAccessValidator {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AccessError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| AccessError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl PlanAccessValidator for RestAccessValidator {
    async fn validate(&self, plan_id: i64, user_id: i64) -> Result<AccessGrant, AccessError> {
        let url = format!("{}/plans/validate-location-share", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&ValidateRequest { plan_id, user_id })
            .send()
            .await
            .map_err(|err| AccessError::Unavailable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AccessError::Unavailable(format!(
                "validate endpoint returned {}",
                response.status()
            )));
        }

        let body: ValidateResponse = response
            .json()
            .await
            .map_err(|err| AccessError::Unavailable(err.to_string()))?;

        if !body.valid {
            return Err(AccessError::Denied(
                body.reason
                    .unwrap_or_else(|| "not a participant of this plan".to_string()),
            ));
        }

        debug!(plan_id, user_id, "location share access granted");
        Ok(AccessGrant {
            user: UserIdentity {
                user_id,
                display_name: body.display_name.unwrap_or_default(),
                profile_image_url: body.profile_image_url,
            },
        })
    }
}
