//! Manual fallback solver.
//!
//! Writes the challenge image to a temp file, prints its path and the
//! instruction caption, and reads click coordinates from stdin. Used when
//! no solving service is configured, and as the human-in-the-loop fallback
//! when an automated backend gives up.

use async_trait::async_trait;
use std::io::Write;

use super::{CaptchaAnswer, CaptchaError, CaptchaSolver, ClickPoint};

#[derive(Default)]
pub struct ManualSolver;

impl ManualSolver {
    pub fn new() -> Self {
        Self
    }
}

/// Parse operator input: `x,y` pairs separated by whitespace or `|`.
fn parse_input(line: &str) -> Result<Vec<ClickPoint>, CaptchaError> {
    let mut points = Vec::new();
    for pair in line.split(|c: char| c.is_whitespace() || c == '|') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (x, y) = pair
            .split_once(',')
            .ok_or_else(|| CaptchaError::Unresolved(format!("expected x,y pair, got {pair:?}")))?;
        let x = x
            .trim()
            .parse::<u32>()
            .map_err(|_| CaptchaError::Unresolved(format!("bad x coordinate: {x:?}")))?;
        let y = y
            .trim()
            .parse::<u32>()
            .map_err(|_| CaptchaError::Unresolved(format!("bad y coordinate: {y:?}")))?;
        points.push(ClickPoint { x, y });
    }
    if points.is_empty() {
        return Err(CaptchaError::Unresolved("no coordinates entered".into()));
    }
    Ok(points)
}

#[async_trait]
impl CaptchaSolver for ManualSolver {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn solve(
        &self,
        image_png: &[u8],
        caption: &str,
    ) -> Result<CaptchaAnswer, CaptchaError> {
        let mut file = tempfile::Builder::new()
            .prefix("captcha-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| CaptchaError::Configuration(e.to_string()))?;
        file.write_all(image_png)
            .and_then(|_| file.flush())
            .map_err(|e| CaptchaError::Configuration(e.to_string()))?;
        let (_, path) = file
            .keep()
            .map_err(|e| CaptchaError::Configuration(e.to_string()))?;

        println!("Challenge image written to {}", path.display());
        println!("Instruction: {caption}");
        println!("Enter click coordinates as x,y pairs (space separated):");

        // Blocking stdin read, moved off the async runtime.
        let line = tokio::task::spawn_blocking(|| {
            let mut buffer = String::new();
            std::io::stdin()
                .read_line(&mut buffer)
                .map(|_| buffer)
        })
        .await
        .map_err(|e| CaptchaError::Provider(e.to_string()))?
        .map_err(|e| CaptchaError::Provider(e.to_string()))?;

        parse_input(&line).map(CaptchaAnswer::unattributed)
    }
}
