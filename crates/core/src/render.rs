//! Rendering capability consumed by the capture stage

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ShotResult;
use crate::shot::{ShotTarget, TargetKey, Viewport, WaitPolicy};

/// Network-bound timeouts (milliseconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub fetch_stories: u64,
    pub load_state: u64,
    pub network_requests: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fetch_stories: 30_000,
            load_state: 30_000,
            network_requests: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn fetch_stories(&self) -> Duration {
        Duration::from_millis(self.fetch_stories)
    }

    pub fn load_state(&self) -> Duration {
        Duration::from_millis(self.load_state)
    }

    pub fn network_requests(&self) -> Duration {
        Duration::from_millis(self.network_requests)
    }
}

/// Everything a renderer needs to produce one screenshot
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub key: TargetKey,
    pub url: String,
    pub viewport: Viewport,
    pub wait: WaitPolicy,
    pub mask_selectors: Vec<String>,
    pub load_state_timeout: Duration,
    pub network_timeout: Duration,
}

impl RenderRequest {
    pub fn for_target(target: &ShotTarget, url: &str, default_viewport: Viewport, timeouts: &TimeoutConfig) -> Self {
        Self {
            key: target.key(),
            url: url.to_string(),
            viewport: target.effective_viewport(default_viewport),
            wait: target.wait,
            mask_selectors: target.mask_selectors().into_iter().map(String::from).collect(),
            load_state_timeout: timeouts.load_state(),
            network_timeout: timeouts.network_requests(),
        }
    }

    /// Upper bound for a whole attempt; anything slower counts as a timeout
    pub fn attempt_budget(&self) -> Duration {
        self.load_state_timeout
            + self.network_timeout
            + Duration::from_millis(self.wait.total_ms())
            + Duration::from_secs(5)
    }
}

/// Renders a page and returns PNG bytes
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> ShotResult<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shot::page_target;

    #[test]
    fn test_request_from_target() {
        let mut target = page_target("home", 0.0);
        target.breakpoint = Some(375);
        target.wait = WaitPolicy {
            before_capture_ms: 100,
            first_network_activity_ms: 200,
            last_network_activity_ms: 300,
        };

        let timeouts = TimeoutConfig {
            fetch_stories: 1,
            load_state: 1_000,
            network_requests: 2_000,
        };
        let request = RenderRequest::for_target(&target, "http://localhost/home", Viewport::default(), &timeouts);

        assert_eq!(request.viewport.width, 375);
        assert_eq!(request.key.as_str(), "home__w375px");
        assert_eq!(request.attempt_budget(), Duration::from_millis(1_000 + 2_000 + 600 + 5_000));
    }
}
