//! ChaoJiYing click-captcha backend.
//!
//! The service takes a base64 image and answers with `x,y` pairs joined by
//! `|`. Passwords travel as an MD5 hex digest, which is the service's wire
//! contract rather than a storage choice. Wrong answers can be reported
//! back by pic id for a refund.

use async_trait::async_trait;
use base64::Engine;
use md5::{Digest, Md5};
use serde::Deserialize;
use std::time::Duration;

use super::{CaptchaAnswer, CaptchaError, CaptchaSolver, ClickPoint};

const UPLOAD_URL: &str = "http://upload.chaojiying.net/Upload/Processing.php";
const REPORT_URL: &str = "http://upload.chaojiying.net/Upload/ReportError.php";

/// Click-captcha code type in the service's taxonomy.
const CLICK_CODETYPE: &str = "9004";

pub struct ChaoJiYingSolver {
    client: reqwest::Client,
    username: String,
    password_md5: String,
    soft_id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    err_no: i32,
    err_str: String,
    #[serde(default)]
    pic_id: String,
    #[serde(default)]
    pic_str: String,
}

impl ChaoJiYingSolver {
    pub fn new(username: &str, password: &str, soft_id: &str) -> Result<Self, CaptchaError> {
        if username.is_empty() || password.is_empty() {
            return Err(CaptchaError::Configuration(
                "chaojiying requires a username and password".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CaptchaError::Configuration(e.to_string()))?;
        let mut hasher = Md5::new();
        hasher.update(password.as_bytes());
        Ok(Self {
            client,
            username: username.to_string(),
            password_md5: hex::encode(hasher.finalize()),
            soft_id: soft_id.to_string(),
        })
    }
}

/// Parse the service's `x1,y1|x2,y2` answer format.
fn parse_points(pic_str: &str) -> Result<Vec<ClickPoint>, CaptchaError> {
    let mut points = Vec::new();
    for pair in pic_str.split('|') {
        let mut coords = pair.split(',');
        let (x, y) = match (coords.next(), coords.next()) {
            (Some(x), Some(y)) => (x.trim(), y.trim()),
            _ => {
                return Err(CaptchaError::Provider(format!(
                    "malformed coordinate pair: {pair:?}"
                )))
            }
        };
        let x = x
            .parse::<u32>()
            .map_err(|_| CaptchaError::Provider(format!("bad x coordinate: {x:?}")))?;
        let y = y
            .parse::<u32>()
            .map_err(|_| CaptchaError::Provider(format!("bad y coordinate: {y:?}")))?;
        points.push(ClickPoint { x, y });
    }
    if points.is_empty() {
        return Err(CaptchaError::Unresolved("empty answer".into()));
    }
    Ok(points)
}

#[async_trait]
impl CaptchaSolver for ChaoJiYingSolver {
    fn name(&self) -> &'static str {
        "chaojiying"
    }

    async fn solve(
        &self,
        image_png: &[u8],
        caption: &str,
    ) -> Result<CaptchaAnswer, CaptchaError> {
        log::debug!("submitting click captcha to chaojiying ({caption})");
        let encoded = base64::engine::general_purpose::STANDARD.encode(image_png);
        let form = [
            ("user", self.username.as_str()),
            ("pass2", self.password_md5.as_str()),
            ("softid", self.soft_id.as_str()),
            ("codetype", CLICK_CODETYPE),
            ("file_base64", encoded.as_str()),
        ];

        let response = self
            .client
            .post(UPLOAD_URL)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CaptchaError::Timeout
                } else {
                    CaptchaError::Provider(e.to_string())
                }
            })?;

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| CaptchaError::Provider(format!("unreadable answer: {e}")))?;

        if body.err_no != 0 {
            return Err(CaptchaError::Unresolved(format!(
                "err_no {}: {}",
                body.err_no, body.err_str
            )));
        }

        let points = parse_points(&body.pic_str)?;
        log::info!(
            "chaojiying solved challenge {} with {} point(s)",
            body.pic_id,
            points.len()
        );
        Ok(CaptchaAnswer {
            points,
            solve_id: Some(body.pic_id),
        })
    }

    async fn report_failure(&self, solve_id: &str) -> Result<(), CaptchaError> {
        log::info!("reporting wrong chaojiying answer for pic {solve_id}");
        let form = [
            ("user", self.username.as_str()),
            ("pass2", self.password_md5.as_str()),
            ("softid", self.soft_id.as_str()),
            ("id", solve_id),
        ];
        self.client
            .post(REPORT_URL)
            .form(&form)
            .send()
            .await
            .map_err(|e| CaptchaError::Provider(e.to_string()))?;
        Ok(())
    }
}
