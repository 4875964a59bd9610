//! Playwright-backed renderer
//!
//! Each render writes a small Node script into a temp dir, runs it with
//! `node`, and reads the screenshot back.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command as TokioCommand;
use tracing::debug;

use crate::diff::MASK_COLOR;
use crate::error::{ShotError, ShotResult};
use crate::render::{RenderRequest, Renderer};

const DISABLE_ANIMATIONS_CSS: &str = "*, *::before, *::after { animation: none !important; transition: none !important; caret-color: transparent !important; }";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub browser: Browser,
    pub headless: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
        }
    }
}

pub struct PlaywrightRenderer {
    browser: Browser,
    headless: bool,
    /// `node_modules` that provides `playwright`
    node_path: PathBuf,
}

impl PlaywrightRenderer {
    /// Create a renderer, failing early when Playwright is missing
    pub fn new(config: &BrowserConfig) -> ShotResult<Self> {
        Self::check_playwright_installed()?;

        let node_path = std::env::current_dir()?.join("node_modules");
        Ok(Self {
            browser: config.browser,
            headless: config.headless,
            node_path,
        })
    }

    fn check_playwright_installed() -> ShotResult<()> {
        let output = Command::new("npx")
            .args(["playwright", "--version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match output {
            Ok(status) if status.success() => Ok(()),
            _ => Err(ShotError::PlaywrightNotFound),
        }
    }

    /// Build the Node script capturing `request` into `output`
    pub fn build_script(&self, request: &RenderRequest, output: &Path) -> String {
        let url = js_string(&request.url);
        let out = js_string(&output.to_string_lossy());
        let masks = request
            .mask_selectors
            .iter()
            .map(|s| format!("page.locator({})", js_string(s)))
            .collect::<Vec<_>>()
            .join(", ");
        let [r, g, b, _] = MASK_COLOR.0;
        let mask_color = format!("#{:02x}{:02x}{:02x}", r, g, b);

        let first_request = if request.wait.first_network_activity_ms > 0 {
            format!(
                "    await page.waitForRequest(() => true, {{ timeout: {} }}).catch(() => null);\n",
                request.wait.first_network_activity_ms
            )
        } else {
            String::new()
        };

        let last_request = if request.wait.last_network_activity_ms > 0 {
            format!(
                "    await page.waitForLoadState('networkidle', {{ timeout: {} }}).catch(() => null);\n",
                request.wait.last_network_activity_ms
            )
        } else {
            String::new()
        };

        format!(
            r#"
const {{ chromium, firefox, webkit }} = require('playwright');

(async () => {{
  const browser = await {browser}.launch({{ headless: {headless} }});
  const context = await browser.newContext({{
    viewport: {{ width: {width}, height: {height} }}
  }});
  const page = await context.newPage();
  page.setDefaultTimeout({network_timeout});

  try {{
    await page.goto({url}, {{ waitUntil: 'load', timeout: {load_timeout} }});
    await page.addStyleTag({{ content: {css} }});
    await page.waitForTimeout({before});
{first_request}{last_request}    await page.screenshot({{
      path: {out},
      animations: 'disabled',
      mask: [{masks}],
      maskColor: '{mask_color}'
    }});
    console.log(JSON.stringify({{ success: true }}));
  }} catch (error) {{
    console.error(JSON.stringify({{ success: false, error: error.message }}));
    process.exit(1);
  }} finally {{
    await browser.close();
  }}
}})();
"#,
            browser = self.browser.as_str(),
            headless = self.headless,
            width = request.viewport.width,
            height = request.viewport.height,
            network_timeout = request.network_timeout.as_millis(),
            first_request = first_request,
            url = url,
            load_timeout = request.load_state_timeout.as_millis(),
            css = js_string(DISABLE_ANIMATIONS_CSS),
            before = request.wait.before_capture_ms,
            last_request = last_request,
            out = out,
            masks = masks,
            mask_color = mask_color,
        )
    }

    async fn run_script(&self, script: &str, dir: &Path) -> ShotResult<()> {
        let script_path = dir.join("capture.js");
        tokio::fs::write(&script_path, script).await?;

        debug!("Running Playwright script: {}", script_path.display());

        let output = TokioCommand::new("node")
            .arg(&script_path)
            .env("NODE_PATH", &self.node_path)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(ShotError::Playwright(format!(
                "Script failed:\nstdout: {}\nstderr: {}",
                stdout, stderr
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Renderer for PlaywrightRenderer {
    async fn render(&self, request: &RenderRequest) -> ShotResult<Vec<u8>> {
        let temp_dir = tempfile::tempdir()?;
        let output = temp_dir.path().join(request.key.file_name());

        let script = self.build_script(request, &output);
        self.run_script(&script, temp_dir.path()).await?;

        Ok(tokio::fs::read(&output).await?)
    }
}

/// Quote a value as a JavaScript string literal
fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shot::{TargetKey, Viewport, WaitPolicy};
    use std::time::Duration;

    fn renderer() -> PlaywrightRenderer {
        PlaywrightRenderer {
            browser: Browser::Firefox,
            headless: true,
            node_path: PathBuf::from("node_modules"),
        }
    }

    fn request(wait: WaitPolicy, masks: Vec<String>) -> RenderRequest {
        RenderRequest {
            key: TargetKey::new("home", None),
            url: "http://localhost:3000/it's".to_string(),
            viewport: Viewport { width: 375, height: 812 },
            wait,
            mask_selectors: masks,
            load_state_timeout: Duration::from_millis(30_000),
            network_timeout: Duration::from_millis(15_000),
        }
    }

    #[test]
    fn test_script_uses_viewport_and_browser() {
        let script = renderer().build_script(&request(WaitPolicy::default(), vec![]), Path::new("/tmp/out.png"));
        assert!(script.contains("firefox.launch({ headless: true })"));
        assert!(script.contains("width: 375, height: 812"));
        assert!(script.contains("timeout: 30000"));
        assert!(script.contains("page.setDefaultTimeout(15000)"));
        assert!(script.contains(r#""http://localhost:3000/it's""#));
        assert!(!script.contains("waitForRequest"));
        assert!(!script.contains("networkidle"));
    }

    #[test]
    fn test_script_waits_and_masks() {
        let wait = WaitPolicy {
            before_capture_ms: 500,
            first_network_activity_ms: 1_000,
            last_network_activity_ms: 2_000,
        };
        let script = renderer().build_script(
            &request(wait, vec![".ad".to_string(), "#clock".to_string()]),
            Path::new("/tmp/out.png"),
        );

        assert!(script.contains("page.waitForTimeout(500)"));
        assert!(script.contains("waitForRequest(() => true, { timeout: 1000 })"));
        assert!(script.contains("waitForLoadState('networkidle', { timeout: 2000 })"));
        assert!(script.contains(r##"mask: [page.locator(".ad"), page.locator("#clock")]"##));
        assert!(script.contains("maskColor: '#808080'"));

        // navigate, fixed wait, first request, settle, screenshot
        let order: Vec<usize> = [
            "page.goto(",
            "page.waitForTimeout(500)",
            "page.waitForRequest(",
            "waitForLoadState('networkidle'",
            "page.screenshot(",
        ]
        .iter()
        .map(|needle| script.find(needle).unwrap())
        .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]), "unexpected step order: {:?}", order);
    }
}
