//! Terminal rendering helpers.

use anyhow::{Context, Result};
use qrcode::QrCode;
use qrcode::render::unicode::Dense1x2;

/// Render `text` as a QR code made of half-block characters
pub fn render_qr(text: &str) -> Result<String> {
    let code = QrCode::new(text.as_bytes()).context("link does not fit in a QR code")?;
    Ok(code
        .render::<Dense1x2>()
        .dark_color(Dense1x2::Light)
        .light_color(Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

/// Reports progress in 10% steps
#[derive(Debug, Default)]
pub struct ProgressSteps {
    last: Option<u8>,
}

impl ProgressSteps {
    /// The step to print for `percent`, if it is a new one
    pub fn update(&mut self, percent: u8) -> Option<u8> {
        let step = percent.min(100) / 10 * 10;
        if self.last.is_some_and(|last| step <= last) {
            return None;
        }
        self.last = Some(step);
        Some(step)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
