//! 2Captcha coordinates backend.
//!
//! Submission goes to `in.php` as a base64 form post; the answer is polled
//! from `res.php` until the worker finishes. Both endpoints speak the
//! legacy `OK|payload` pipe protocol; coordinates come back as `x:y` pairs
//! joined by commas.

use async_trait::async_trait;
use base64::Engine;
use std::time::Duration;

use super::{CaptchaAnswer, CaptchaError, CaptchaSolver, ClickPoint};

const SUBMIT_URL: &str = "http://2captcha.com/in.php";
const RESULT_URL: &str = "http://2captcha.com/res.php";

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const POLL_BUDGET: Duration = Duration::from_secs(120);

pub struct TwoCaptchaSolver {
    client: reqwest::Client,
    api_key: String,
}

impl TwoCaptchaSolver {
    pub fn new(api_key: &str) -> Result<Self, CaptchaError> {
        if api_key.is_empty() {
            return Err(CaptchaError::Configuration(
                "2captcha requires an api key".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CaptchaError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
        })
    }

    async fn submit(&self, image_png: &[u8], caption: &str) -> Result<String, CaptchaError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image_png);
        let form = [
            ("key", self.api_key.as_str()),
            ("method", "base64"),
            ("coordinatescaptcha", "1"),
            ("textinstructions", caption),
            ("body", encoded.as_str()),
        ];
        let body = self
            .client
            .post(SUBMIT_URL)
            .form(&form)
            .send()
            .await
            .map_err(|e| CaptchaError::Provider(e.to_string()))?
            .text()
            .await
            .map_err(|e| CaptchaError::Provider(e.to_string()))?;

        match body.split_once('|') {
            Some(("OK", id)) => Ok(id.to_string()),
            _ => Err(CaptchaError::Provider(format!("submit rejected: {body}"))),
        }
    }

    async fn poll(&self, task_id: &str) -> Result<String, CaptchaError> {
        let deadline = tokio::time::Instant::now() + POLL_BUDGET;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if tokio::time::Instant::now() > deadline {
                return Err(CaptchaError::Timeout);
            }

            let body = self
                .client
                .get(RESULT_URL)
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", task_id),
                ])
                .send()
                .await
                .map_err(|e| CaptchaError::Provider(e.to_string()))?
                .text()
                .await
                .map_err(|e| CaptchaError::Provider(e.to_string()))?;

            if body == "CAPCHA_NOT_READY" {
                continue;
            }
            return match body.split_once('|') {
                Some(("OK", answer)) => Ok(answer.to_string()),
                _ => Err(CaptchaError::Unresolved(body)),
            };
        }
    }
}

/// Parse the `coordinates:x=..,y=..;x=..,y=..` answer format. The service
/// also emits the terser `x,y` list for some worker pools, so both shapes
/// are accepted.
fn parse_points(answer: &str) -> Result<Vec<ClickPoint>, CaptchaError> {
    let body = answer.strip_prefix("coordinates:").unwrap_or(answer);
    let mut points = Vec::new();
    for chunk in body.split(';').filter(|c| !c.trim().is_empty()) {
        let mut x = None;
        let mut y = None;
        for part in chunk.split(',') {
            match part.trim().split_once('=') {
                Some(("x", v)) => x = v.parse::<u32>().ok(),
                Some(("y", v)) => y = v.parse::<u32>().ok(),
                _ => {}
            }
        }
        match (x, y) {
            (Some(x), Some(y)) => points.push(ClickPoint { x, y }),
            _ => {
                return Err(CaptchaError::Provider(format!(
                    "malformed coordinate chunk: {chunk:?}"
                )))
            }
        }
    }
    if points.is_empty() {
        return Err(CaptchaError::Unresolved(format!(
            "no coordinates in answer: {answer:?}"
        )));
    }
    Ok(points)
}

#[async_trait]
impl CaptchaSolver for TwoCaptchaSolver {
    fn name(&self) -> &'static str {
        "2captcha"
    }

    async fn solve(
        &self,
        image_png: &[u8],
        caption: &str,
    ) -> Result<CaptchaAnswer, CaptchaError> {
        let task_id = self.submit(image_png, caption).await?;
        log::debug!("2captcha task {task_id} submitted, polling");
        let answer = self.poll(&task_id).await?;
        let points = parse_points(&answer)?;
        log::info!("2captcha task {task_id} solved with {} point(s)", points.len());
        Ok(CaptchaAnswer {
            points,
            solve_id: Some(task_id),
        })
    }

    async fn report_failure(&self, solve_id: &str) -> Result<(), CaptchaError> {
        self.client
            .get(RESULT_URL)
            .query(&[
                ("key", self.api_key.as_str()),
                ("action", "reportbad"),
                ("id", solve_id),
            ])
            .send()
            .await
            .map_err(|e| CaptchaError::Provider(e.to_string()))?;
        Ok(())
    }
}
